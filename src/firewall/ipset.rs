use std::path::PathBuf;

use ipnet::IpNet;
use tracing::{info, instrument};

use super::command::{args, exec, run};
use super::FirewallBackend;
use crate::error::BackendError;

/// `hash:net` sets `<table>4` and `<table>6`, matched from INPUT.
#[derive(Debug)]
pub struct IpsetBackend {
    ipset: PathBuf,
    iptables: PathBuf,
    ip6tables: PathBuf,
    table: String,
}

impl IpsetBackend {
    pub fn new(ipset: PathBuf, iptables: PathBuf, ip6tables: PathBuf, table: String) -> Self {
        Self {
            ipset,
            iptables,
            ip6tables,
            table,
        }
    }

    fn set_name(&self, net: &IpNet) -> String {
        set_name(&self.table, net)
    }
}

pub(super) fn set_name(table: &str, net: &IpNet) -> String {
    match net {
        IpNet::V4(_) => format!("{table}4"),
        IpNet::V6(_) => format!("{table}6"),
    }
}

fn match_rule(op: &str, set: &str) -> Vec<String> {
    args([op, "INPUT", "-m", "set", "--match-set", set, "src", "-j", "DROP"])
}

impl FirewallBackend for IpsetBackend {
    fn name(&self) -> &'static str {
        "ipset"
    }

    #[instrument(skip(self))]
    async fn setup(&self) -> Result<(), BackendError> {
        let sets = [
            (format!("{}4", self.table), "inet", &self.iptables),
            (format!("{}6", self.table), "inet6", &self.ip6tables),
        ];
        for (set, family, filter) in sets {
            run(
                &self.ipset,
                &args(["-exist", "create", &set, "hash:net", "family", family]),
            )
            .await?;
            if !exec(filter, &match_rule("-C", &set)).await?.status.success() {
                info!(msg = "Hooking set into INPUT", set);
                run(filter, &match_rule("-I", &set)).await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn apply(&self, net: IpNet) -> Result<(), BackendError> {
        let set = self.set_name(&net);
        run(&self.ipset, &args(["-exist", "add", &set, &net.to_string()])).await
    }

    #[instrument(skip(self))]
    async fn remove(&self, net: IpNet) -> Result<(), BackendError> {
        let set = self.set_name(&net);
        run(&self.ipset, &args(["-exist", "del", &set, &net.to_string()])).await
    }
}
