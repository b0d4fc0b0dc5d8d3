use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::coordinator::Coordinator;
use crate::error::BanError;
use crate::firewall::FirewallBackend;
use crate::request::Request;
use crate::scheduler::ExpiryScheduler;

/// Applies one decoded request. Failures are logged, never propagated: a
/// bad request must not stop the daemon.
pub async fn handle_request<B: FirewallBackend>(
    coordinator: &mut Coordinator<B>,
    request: Request,
    now: DateTime<Utc>,
) {
    match request {
        Request::Ban(ban) => match coordinator.ban(ban, now).await {
            Ok(outcome) => debug!(msg = "Ban handled", ?outcome),
            Err(err @ BanError::Trusted(_)) => info!(msg = "Ignoring ban request", %err),
            Err(err) => error!(msg = "Ban request failed", %err),
        },
        Request::Unban(address) => match coordinator.unban(address).await {
            Ok(outcome) => debug!(msg = "Unban handled", ?outcome),
            Err(err @ BanError::NotFound(_)) => info!(msg = "Ignoring unban request", %err),
            Err(err) => error!(msg = "Unban request failed", %err),
        },
    }
}

/// Serves requests and expiries until `shutdown` resolves.
///
/// Overdue expiries are handled before each request, so a steady stream of
/// requests cannot hold them back. A closed request channel means the
/// listener died, which is an error.
pub async fn run<B, F>(
    coordinator: &mut Coordinator<B>,
    scheduler: ExpiryScheduler,
    mut requests: mpsc::Receiver<Request>,
    shutdown: F,
) -> Result<(), anyhow::Error>
where
    B: FirewallBackend,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    info!(msg = "Starting control loop", active_bans = coordinator.len());

    loop {
        let now = Utc::now();
        if coordinator.next_expiry().is_some_and(|at| at <= now) {
            expire(coordinator, now).await;
        }

        let wake = scheduler.next_wake(Utc::now(), coordinator.next_expiry());
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!(msg = "Control loop stopping", active_bans = coordinator.len());
                return Ok(());
            }
            request = requests.recv() => match request {
                Some(request) => handle_request(coordinator, request, Utc::now()).await,
                None => anyhow::bail!("request listener stopped"),
            },
            _ = tokio::time::sleep(wake) => expire(coordinator, Utc::now()).await,
        }
    }
}

async fn expire<B: FirewallBackend>(coordinator: &mut Coordinator<B>, now: DateTime<Utc>) {
    let lifted = coordinator.expire(now).await;
    if !lifted.is_empty() {
        debug!(msg = "Expiry pass done", lifted = lifted.len());
    }
}
