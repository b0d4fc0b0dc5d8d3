use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use ipnet::IpNet;
use tracing::info;

use super::FirewallBackend;
use crate::error::BackendError;

/// Keeps the "firewall" in memory and logs every change.
#[derive(Debug, Default)]
pub struct DummyBackend {
    applied: Mutex<BTreeSet<IpNet>>,
}

impl DummyBackend {
    pub fn applied(&self) -> Vec<IpNet> {
        self.nets().iter().copied().collect()
    }

    pub fn is_applied(&self, net: &IpNet) -> bool {
        self.nets().contains(net)
    }

    fn nets(&self) -> std::sync::MutexGuard<'_, BTreeSet<IpNet>> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FirewallBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn apply(&self, net: IpNet) -> Result<(), BackendError> {
        let inserted = self.nets().insert(net);
        info!(msg = "Blocked", %net, inserted);
        Ok(())
    }

    async fn remove(&self, net: IpNet) -> Result<(), BackendError> {
        let removed = self.nets().remove(&net);
        info!(msg = "Unblocked", %net, removed);
        Ok(())
    }
}
