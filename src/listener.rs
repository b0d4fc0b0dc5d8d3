use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::metrics::{MALFORMED_REQUESTS_COUNTER, REQUESTS_RECEIVED_COUNTER};
use crate::queue::{MessageQueue, RawMessage};
use crate::request::{self, Request};

/// Blocking supplier of raw queue messages.
pub trait MessageSource: Send {
    fn receive(&mut self) -> Result<RawMessage, QueueError>;
}

impl MessageSource for MessageQueue {
    fn receive(&mut self) -> Result<RawMessage, QueueError> {
        MessageQueue::receive(self)
    }
}

pub struct Listener<S> {
    source: S,
    requests: mpsc::Sender<Request>,
}

impl<S: MessageSource> Listener<S> {
    pub fn new(source: S, requests: mpsc::Sender<Request>) -> Self {
        Self { source, requests }
    }

    /// Receives until the queue becomes unusable or the request channel is
    /// closed. Must run outside the async runtime: both the receive and the
    /// hand-off block.
    pub fn run(mut self) -> Result<(), QueueError> {
        info!("Listening for requests");
        loop {
            let message = match self.source.receive() {
                Ok(message) => message,
                Err(QueueError::Interrupted) => continue,
                Err(err @ QueueError::Oversized { .. }) => {
                    warn!(msg = "Dropping message", %err);
                    MALFORMED_REQUESTS_COUNTER.inc();
                    continue;
                }
                // the queue is removed at shutdown, after the channel closes
                Err(_) if self.requests.is_closed() => {
                    info!("Queue closed, listener stopping");
                    return Ok(());
                }
                Err(err) => {
                    error!(msg = "Stopped receiving requests", %err);
                    return Err(err);
                }
            };

            let request = match request::decode(message.kind, &message.payload) {
                Ok(request) => request,
                Err(err) => {
                    warn!(
                        msg = "Dropping malformed request",
                        kind = message.kind,
                        payload = %String::from_utf8_lossy(&message.payload),
                        %err
                    );
                    MALFORMED_REQUESTS_COUNTER.inc();
                    continue;
                }
            };

            REQUESTS_RECEIVED_COUNTER
                .with_label_values(&[request.kind()])
                .inc();
            debug!(msg = "Received request", ?request);
            if self.requests.blocking_send(request).is_err() {
                info!("Request channel closed, listener stopping");
                return Ok(());
            }
        }
    }
}

impl<S: MessageSource + 'static> Listener<S> {
    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<(), QueueError>>> {
        std::thread::Builder::new()
            .name(String::from("banipd-listener"))
            .spawn(move || self.run())
    }
}
