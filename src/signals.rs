use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::allowlist::{AllowlistCache, TrustedSources};
use crate::tracing_setup::LogFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT, SIGTERM or SIGQUIT
    Shutdown,
    /// SIGHUP
    Reload,
    /// SIGUSR1
    ReopenLog,
}

pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    hangup: Signal,
    user1: Signal,
}

impl Signals {
    /// Handlers are registered right away so no signal is lost between
    /// startup and the first `recv`.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
            user1: signal(SignalKind::user_defined1())?,
        })
    }

    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.interrupt.recv() => SignalEvent::Shutdown,
            _ = self.terminate.recv() => SignalEvent::Shutdown,
            _ = self.quit.recv() => SignalEvent::Shutdown,
            _ = self.hangup.recv() => SignalEvent::Reload,
            _ = self.user1.recv() => SignalEvent::ReopenLog,
        }
    }
}

/// What the daemon can refresh without restarting.
pub struct Reloadable {
    pub allowlist: Arc<AllowlistCache>,
    pub trusted: TrustedSources,
    pub log_file: Option<LogFile>,
}

impl Reloadable {
    pub fn reload(&self) {
        match self.allowlist.reload(&self.trusted) {
            Ok(()) => info!(msg = "Trusted networks reloaded"),
            Err(err) => error!(msg = "Keeping previous trusted networks", err = %format!("{err:#}")),
        }
    }

    pub fn reopen_log(&self) {
        if let Some(log_file) = &self.log_file {
            match log_file.reopen() {
                Ok(()) => info!(msg = "Log file reopened", path = %log_file.path().display()),
                Err(err) => error!(msg = "Failed to reopen log file", %err),
            }
        }
    }
}

/// Serves reload requests until a shutdown signal arrives, then fires
/// `shutdown`.
pub async fn watch(mut signals: Signals, reloadable: Reloadable, shutdown: oneshot::Sender<()>) {
    loop {
        match signals.recv().await {
            SignalEvent::Shutdown => {
                info!("Shutdown requested");
                let _ = shutdown.send(());
                return;
            }
            SignalEvent::Reload => reloadable.reload(),
            SignalEvent::ReopenLog => reloadable.reopen_log(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Reloadable, SignalEvent, Signals};
    use crate::allowlist::{AllowlistCache, TrustedSources};

    #[test]
    fn reload_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trusted.txt");
        std::fs::write(&path, "10.0.0.0/8\n").unwrap();
        let trusted = TrustedSources {
            ips: Vec::new(),
            file: Some(path.clone()),
        };
        let reloadable = Reloadable {
            allowlist: Arc::new(AllowlistCache::new(trusted.load().unwrap())),
            trusted,
            log_file: None,
        };

        std::fs::write(&path, "172.16.0.0/12\n").unwrap();
        reloadable.reload();
        assert!(reloadable
            .allowlist
            .is_trusted(&"172.16.1.1/32".parse().unwrap()));
        assert!(!reloadable
            .allowlist
            .is_trusted(&"10.0.0.1/32".parse().unwrap()));
        reloadable.reopen_log();
    }

    #[tokio::test]
    async fn quit_shuts_down() {
        let mut signals = Signals::install().unwrap();
        // SAFETY: plain syscall, SIGQUIT is handled from here on
        unsafe { libc::kill(libc::getpid(), libc::SIGQUIT) };
        let event = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(event, SignalEvent::Shutdown);
    }
}
