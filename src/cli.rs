use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ipnet::IpNet;
use reqwest::Url;

use crate::allowlist::TrustedSources;
use crate::firewall::EngineConfig;
use crate::queue::QueueSpec;
use crate::utils::RetryPolicy;
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    Dummy,
    Iptables,
    Ipset,
    Nftables,
    Vyos,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o777)
        .ok_or_else(|| format!("'{s}' is not an octal permission mode"))
}

#[derive(Parser, Debug)]
#[command(version, about = "Bans IP addresses requested over a System V message queue", long_about = None)]
pub struct Cli {
    /// Queue identity file, optionally followed by `:C` to pick the id byte
    #[arg(short, long, env = "BANIPD_QUEUE", default_value = "/run/banipd.queue")]
    pub queue: QueueSpec,

    /// Octal permissions of the message queue
    #[arg(long, env = "BANIPD_QUEUE_MODE", default_value = "420", value_parser = parse_mode)]
    pub queue_mode: u32,

    /// Largest accepted message payload in bytes
    #[arg(short = 'b', long, default_value_t = 1024, value_parser = clap::value_parser!(u64).range(16..=65536))]
    pub msgsize: u64,

    #[arg(short, long, value_enum, env = "BANIPD_ENGINE", default_value_t = Engine::Iptables)]
    pub engine: Engine,

    /// Chain, set or group name used by the engine
    #[arg(short, long, env = "BANIPD_TABLE", default_value = "banip")]
    pub table: String,

    /// Keep bans across restarts in this file
    #[arg(long, env = "BANIPD_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Networks that are never banned
    #[arg(long = "trusted-ips", num_args = 1.., value_delimiter = ',')]
    pub trusted_ips: Vec<IpNet>,

    /// File of trusted networks, re-read on SIGHUP
    #[arg(long, env = "BANIPD_TRUSTED_FILE")]
    pub trusted_file: Option<PathBuf>,

    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub expiry_interval_secs: u64,

    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub backend_retries: u32,

    #[arg(long, default_value_t = 200)]
    pub backend_retry_delay_ms: u64,

    /// Log to this file instead of stdout, reopened on SIGUSR1
    #[arg(short, long, env = "BANIPD_LOG")]
    pub log: Option<PathBuf>,

    #[arg(short, long, env = "BANIPD_PID")]
    pub pid: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "BANIPD_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    #[arg(long, default_value = "iptables")]
    pub iptables_path: PathBuf,

    #[arg(long, default_value = "ip6tables")]
    pub ip6tables_path: PathBuf,

    #[arg(long, default_value = "ipset")]
    pub ipset_path: PathBuf,

    #[arg(long, default_value = "nft")]
    pub nft_path: PathBuf,

    #[arg(long, default_value = "inet")]
    pub nft_family: String,

    #[arg(long, default_value = "filter")]
    pub nft_table: String,

    #[arg(long, env = "VYOS_API")]
    pub vyos_api: Option<Url>,

    #[arg(long, env = "VYOS_APIKEY", hide_env_values = true)]
    pub vyos_apikey: Option<String>,

    /// Save the VyOS configuration after every change
    #[arg(long)]
    pub vyos_save: bool,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig, anyhow::Error> {
        Ok(match self.engine {
            Engine::Dummy => EngineConfig::Dummy,
            Engine::Iptables => EngineConfig::Iptables {
                iptables: self.iptables_path.clone(),
                ip6tables: self.ip6tables_path.clone(),
                chain: self.table.clone(),
            },
            Engine::Ipset => EngineConfig::Ipset {
                ipset: self.ipset_path.clone(),
                iptables: self.iptables_path.clone(),
                ip6tables: self.ip6tables_path.clone(),
                table: self.table.clone(),
            },
            Engine::Nftables => EngineConfig::Nftables {
                nft: self.nft_path.clone(),
                family: self.nft_family.clone(),
                table: self.nft_table.clone(),
                set: self.table.clone(),
            },
            Engine::Vyos => EngineConfig::Vyos {
                host: self
                    .vyos_api
                    .clone()
                    .context("--vyos-api is required by the vyos engine")?,
                apikey: self
                    .vyos_apikey
                    .clone()
                    .context("--vyos-apikey is required by the vyos engine")?,
                group: self.table.clone(),
                save: self.vyos_save,
            },
        })
    }

    pub fn into_config(self) -> Result<Config, anyhow::Error> {
        let engine = self.engine_config()?;
        Ok(Config {
            queue: self.queue,
            queue_mode: self.queue_mode,
            msgsize: usize::try_from(self.msgsize)?,
            engine,
            state_file: self.state_file,
            trusted: TrustedSources {
                ips: self.trusted_ips,
                file: self.trusted_file,
            },
            expiry_interval: Duration::from_secs(self.expiry_interval_secs),
            retry: RetryPolicy {
                attempts: self.backend_retries,
                base_delay: Duration::from_millis(self.backend_retry_delay_ms),
            },
            pid_file: self.pid,
            metrics_addr: self.metrics_addr,
        })
    }
}
