mod command;
mod dummy;
mod ipset;
mod iptables;
mod nftables;
mod vyos;

use std::future::Future;
use std::path::PathBuf;

use ipnet::IpNet;
use reqwest::Url;

pub use dummy::DummyBackend;
pub use ipset::IpsetBackend;
pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;
pub use vyos::VyosBackend;

use crate::error::BackendError;

/// A packet filter able to block single networks.
///
/// Both `apply` and `remove` must be idempotent: applying a rule that is
/// already present, or removing one that is absent, succeeds without change.
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepares tables/sets/chains the engine relies on.
    fn setup(&self) -> impl Future<Output = Result<(), BackendError>> + Send {
        async { Ok(()) }
    }

    fn apply(&self, net: IpNet) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn remove(&self, net: IpNet) -> impl Future<Output = Result<(), BackendError>> + Send;
}

#[derive(Debug, Clone)]
pub enum EngineConfig {
    Dummy,
    Iptables {
        iptables: PathBuf,
        ip6tables: PathBuf,
        chain: String,
    },
    Ipset {
        ipset: PathBuf,
        iptables: PathBuf,
        ip6tables: PathBuf,
        table: String,
    },
    Nftables {
        nft: PathBuf,
        family: String,
        table: String,
        set: String,
    },
    Vyos {
        host: Url,
        apikey: String,
        group: String,
        save: bool,
    },
}

/// The engine selected at startup.
#[derive(Debug)]
pub enum Engine {
    Dummy(DummyBackend),
    Iptables(IptablesBackend),
    Ipset(IpsetBackend),
    Nftables(NftablesBackend),
    Vyos(VyosBackend),
}

impl Engine {
    pub fn from_config(config: EngineConfig) -> Result<Self, BackendError> {
        Ok(match config {
            EngineConfig::Dummy => Self::Dummy(DummyBackend::default()),
            EngineConfig::Iptables {
                iptables,
                ip6tables,
                chain,
            } => Self::Iptables(IptablesBackend::new(iptables, ip6tables, chain)),
            EngineConfig::Ipset {
                ipset,
                iptables,
                ip6tables,
                table,
            } => Self::Ipset(IpsetBackend::new(ipset, iptables, ip6tables, table)),
            EngineConfig::Nftables {
                nft,
                family,
                table,
                set,
            } => Self::Nftables(NftablesBackend::new(nft, family, table, set)),
            EngineConfig::Vyos {
                host,
                apikey,
                group,
                save,
            } => Self::Vyos(VyosBackend::new(host, apikey, group, save)?),
        })
    }
}

impl FirewallBackend for Engine {
    fn name(&self) -> &'static str {
        match self {
            Self::Dummy(backend) => backend.name(),
            Self::Iptables(backend) => backend.name(),
            Self::Ipset(backend) => backend.name(),
            Self::Nftables(backend) => backend.name(),
            Self::Vyos(backend) => backend.name(),
        }
    }

    async fn setup(&self) -> Result<(), BackendError> {
        match self {
            Self::Dummy(backend) => backend.setup().await,
            Self::Iptables(backend) => backend.setup().await,
            Self::Ipset(backend) => backend.setup().await,
            Self::Nftables(backend) => backend.setup().await,
            Self::Vyos(backend) => backend.setup().await,
        }
    }

    async fn apply(&self, net: IpNet) -> Result<(), BackendError> {
        match self {
            Self::Dummy(backend) => backend.apply(net).await,
            Self::Iptables(backend) => backend.apply(net).await,
            Self::Ipset(backend) => backend.apply(net).await,
            Self::Nftables(backend) => backend.apply(net).await,
            Self::Vyos(backend) => backend.apply(net).await,
        }
    }

    async fn remove(&self, net: IpNet) -> Result<(), BackendError> {
        match self {
            Self::Dummy(backend) => backend.remove(net).await,
            Self::Iptables(backend) => backend.remove(net).await,
            Self::Ipset(backend) => backend.remove(net).await,
            Self::Nftables(backend) => backend.remove(net).await,
            Self::Vyos(backend) => backend.remove(net).await,
        }
    }
}
