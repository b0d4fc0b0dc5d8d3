use std::path::PathBuf;

use ipnet::IpNet;
use tracing::{info, instrument};

use super::command::{args, check, exec, run};
use super::ipset::set_name;
use super::FirewallBackend;
use crate::error::BackendError;

/// Elements of the interval sets `<set>4` and `<set>6` in `family table`,
/// dropped by a base chain `<set>` hooked on input.
#[derive(Debug)]
pub struct NftablesBackend {
    nft: PathBuf,
    family: String,
    table: String,
    set: String,
}

impl NftablesBackend {
    pub fn new(nft: PathBuf, family: String, table: String, set: String) -> Self {
        Self {
            nft,
            family,
            table,
            set,
        }
    }

    fn element(&self, op: &str, net: IpNet) -> Vec<String> {
        element_command(&self.family, &self.table, &set_name(&self.set, &net), op, net)
    }
}

pub(super) fn element_command(
    family: &str,
    table: &str,
    set: &str,
    op: &str,
    net: IpNet,
) -> Vec<String> {
    args([op, "element", family, table, set, &format!("{{ {net} }}")])
}

const BASE_CHAIN: &str = "{ type filter hook input priority 0; policy accept; }";

/// An `ip` or `ip6` table only takes rules for its own protocol.
fn family_handles(family: &str, proto: &str) -> bool {
    family == proto || !matches!(family, "ip" | "ip6")
}

fn set_definition(addr_type: &str) -> String {
    format!("{{ type {addr_type}; flags interval; }}")
}

impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    #[instrument(skip(self))]
    async fn setup(&self) -> Result<(), BackendError> {
        run(&self.nft, &args(["add", "table", &self.family, &self.table])).await?;
        for (suffix, addr_type) in [("4", "ipv4_addr"), ("6", "ipv6_addr")] {
            let set = format!("{}{suffix}", self.set);
            run(
                &self.nft,
                &args([
                    "add",
                    "set",
                    &self.family,
                    &self.table,
                    &set,
                    &set_definition(addr_type),
                ]),
            )
            .await?;
        }

        let chain = &self.set;
        run(
            &self.nft,
            &args(["add", "chain", &self.family, &self.table, chain, BASE_CHAIN]),
        )
        .await?;
        // the chain is ours; rebuilding its rules keeps them unique
        run(&self.nft, &args(["flush", "chain", &self.family, &self.table, chain])).await?;
        for (proto, suffix) in [("ip", "4"), ("ip6", "6")] {
            if !family_handles(&self.family, proto) {
                continue;
            }
            let set = format!("@{}{suffix}", self.set);
            run(
                &self.nft,
                &args([
                    "add", "rule", &self.family, &self.table, chain, proto, "saddr", &set, "drop",
                ]),
            )
            .await?;
        }
        info!(msg = "Input chain ready", family = self.family, table = self.table, chain);
        Ok(())
    }

    // `add element` is already a no-op for present elements
    #[instrument(skip(self))]
    async fn apply(&self, net: IpNet) -> Result<(), BackendError> {
        run(&self.nft, &self.element("add", net)).await
    }

    #[instrument(skip(self))]
    async fn remove(&self, net: IpNet) -> Result<(), BackendError> {
        let output = exec(&self.nft, &self.element("delete", net)).await?;
        if !output.status.success() && is_missing_element(&output.stderr) {
            return Ok(());
        }
        check(&self.nft, output)
    }
}

fn is_missing_element(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr).contains("No such file or directory")
}
