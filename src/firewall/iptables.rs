use std::path::{Path, PathBuf};

use ipnet::IpNet;
use tracing::{info, instrument};

use super::command::{args, exec, run};
use super::FirewallBackend;
use crate::error::BackendError;

/// DROP rules inside a dedicated chain, one per banned network. The chain
/// is jumped to from INPUT.
#[derive(Debug)]
pub struct IptablesBackend {
    iptables: PathBuf,
    ip6tables: PathBuf,
    chain: String,
}

impl IptablesBackend {
    pub fn new(iptables: PathBuf, ip6tables: PathBuf, chain: String) -> Self {
        Self {
            iptables,
            ip6tables,
            chain,
        }
    }

    fn program(&self, net: &IpNet) -> &Path {
        match net {
            IpNet::V4(_) => &self.iptables,
            IpNet::V6(_) => &self.ip6tables,
        }
    }

    async fn rule_exists(&self, net: IpNet) -> Result<bool, BackendError> {
        let output = exec(self.program(&net), &drop_rule(&self.chain, "-C", net)).await?;
        Ok(output.status.success())
    }
}

/// `iptables <op> INPUT -j CHAIN`
fn input_jump(op: &str, chain: &str) -> Vec<String> {
    args([op, "INPUT", "-j", chain])
}

/// `iptables <op> CHAIN -s NET -j DROP`
pub(super) fn drop_rule(chain: &str, op: &str, net: IpNet) -> Vec<String> {
    args([op, chain, "-s", &net.to_string(), "-j", "DROP"])
}

impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    #[instrument(skip(self))]
    async fn setup(&self) -> Result<(), BackendError> {
        for program in [&self.iptables, &self.ip6tables] {
            let listed = exec(program, &args(["-n", "-L", &self.chain])).await?;
            if !listed.status.success() {
                info!(msg = "Creating chain", chain = self.chain, program = %program.display());
                run(program, &args(["-N", &self.chain])).await?;
            }
            if !exec(program, &input_jump("-C", &self.chain)).await?.status.success() {
                info!(msg = "Hooking chain into INPUT", chain = self.chain, program = %program.display());
                run(program, &input_jump("-I", &self.chain)).await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn apply(&self, net: IpNet) -> Result<(), BackendError> {
        if self.rule_exists(net).await? {
            return Ok(());
        }
        let mut insert = drop_rule(&self.chain, "-I", net);
        insert.insert(2, String::from("1"));
        run(self.program(&net), &insert).await
    }

    #[instrument(skip(self))]
    async fn remove(&self, net: IpNet) -> Result<(), BackendError> {
        if !self.rule_exists(net).await? {
            return Ok(());
        }
        run(self.program(&net), &drop_rule(&self.chain, "-D", net)).await
    }
}
