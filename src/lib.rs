pub mod allowlist;
pub mod cli;
pub mod control_loop;
pub mod coordinator;
pub mod error;
pub mod firewall;
pub mod listener;
pub mod metrics;
pub mod prometheus;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod signals;
pub mod state;
pub mod tracing_setup;
pub mod utils;
pub mod vyos_api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use allowlist::{AllowlistCache, TrustedSources};
use coordinator::Coordinator;
use firewall::{Engine, EngineConfig, FirewallBackend};
use listener::Listener;
use prometheus::Prometheus;
use queue::{OwnedQueue, QueueSpec};
use scheduler::ExpiryScheduler;
use signals::{Reloadable, Signals};
use state::StateFile;
use tracing_setup::LogFile;
use utils::{PidFile, RetryPolicy};

pub(crate) const USER_AGENT: &str = "banipd/v0.1.0";

/// Decoded requests waiting for the control loop.
const REQUEST_BACKLOG: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueSpec,
    pub queue_mode: u32,
    pub msgsize: usize,
    pub engine: EngineConfig,
    pub state_file: Option<PathBuf>,
    pub trusted: TrustedSources,
    pub expiry_interval: Duration,
    pub retry: RetryPolicy,
    pub pid_file: Option<PathBuf>,
    pub metrics_addr: Option<SocketAddr>,
}

pub struct App {
    config: Config,
    allowlist: Arc<AllowlistCache>,
    log_file: Option<LogFile>,
}

impl App {
    pub fn new(config: Config, log_file: Option<LogFile>) -> Result<Self, anyhow::Error> {
        let trusted = config
            .trusted
            .load()
            .context("loading trusted networks")?;
        Ok(Self {
            config,
            allowlist: Arc::new(AllowlistCache::new(trusted)),
            log_file,
        })
    }

    /// Runs the daemon until a shutdown signal, or until the queue becomes
    /// unusable, which is reported as an error.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let _pid_file = self
            .config
            .pid_file
            .as_deref()
            .map(PidFile::create)
            .transpose()
            .context("writing pid file")?;

        let engine = Engine::from_config(self.config.engine.clone())?;
        engine
            .setup()
            .await
            .with_context(|| format!("preparing the {} firewall", engine.name()))?;
        info!(msg = "Firewall ready", engine = engine.name());

        let mut coordinator =
            Coordinator::new(engine, self.allowlist.clone(), self.config.retry.clone());
        if let Some(path) = &self.config.state_file {
            coordinator = coordinator.with_state_file(StateFile::new(path));
        }
        let restored = coordinator.restore(Utc::now()).await?;
        info!(msg = "Ban table restored", active_bans = restored);

        if let Some(addr) = self.config.metrics_addr {
            tokio::spawn(async move {
                if let Err(err) = Prometheus::new(addr).serve().await {
                    error!(msg = "Metrics server stopped", %err);
                }
            });
        }

        let signals = Signals::install().context("installing signal handlers")?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(signals::watch(
            signals,
            Reloadable {
                allowlist: self.allowlist.clone(),
                trusted: self.config.trusted.clone(),
                log_file: self.log_file.clone(),
            },
            shutdown_tx,
        ));

        let queue = OwnedQueue::create(
            &self.config.queue,
            self.config.queue_mode,
            self.config.msgsize,
        )?;
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_BACKLOG);
        let listener = Listener::new(queue.queue(), requests_tx)
            .spawn()
            .context("starting listener thread")?;

        let result = control_loop::run(
            &mut coordinator,
            ExpiryScheduler::new(self.config.expiry_interval),
            requests_rx,
            async {
                let _ = shutdown_rx.await;
            },
        )
        .await;

        // removing the queue wakes the listener out of its blocking receive
        drop(queue);
        let listener_result = tokio::task::spawn_blocking(move || listener.join())
            .await
            .context("joining listener thread")?;
        match listener_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err).context("message queue failed"),
            Err(_) => warn!("Listener thread panicked"),
        }

        result?;
        info!(msg = "Exit", active_bans = coordinator.len());
        Ok(())
    }
}
