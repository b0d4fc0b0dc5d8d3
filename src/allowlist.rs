use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use iprange::IpRange;

use crate::request::parse_address;
use crate::utils::read_file;

/// Networks that must never be banned, swapped atomically on reload.
#[derive(Debug, Default)]
pub struct AllowlistCache(pub ArcSwap<IpRangeMixed>);

impl AllowlistCache {
    pub fn new(ip_ranges: IpRangeMixed) -> Self {
        Self(ArcSwap::from_pointee(ip_ranges))
    }
    pub fn store(&self, ip_ranges: IpRangeMixed) {
        self.0.store(Arc::new(ip_ranges));
    }
    pub fn load(&self) -> Arc<IpRangeMixed> {
        self.0.load_full()
    }
    pub fn is_trusted(&self, net: &IpNet) -> bool {
        self.0.load().overlaps(net)
    }

    /// Re-reads `sources`; the current ranges stay in place on error.
    pub fn reload(&self, sources: &TrustedSources) -> Result<(), anyhow::Error> {
        let ranges = sources.load()?;
        self.store(ranges);
        Ok(())
    }
}

/// Trusted networks given on the command line plus an optional file.
#[derive(Debug, Clone, Default)]
pub struct TrustedSources {
    pub ips: Vec<IpNet>,
    pub file: Option<PathBuf>,
}

impl TrustedSources {
    pub fn load(&self) -> Result<IpRangeMixed, anyhow::Error> {
        let ranges = IpRangeMixed::from(self.ips.clone());
        match &self.file {
            Some(path) => Ok(ranges.merge(&IpRangeMixed::load(path)?)),
            None => Ok(ranges),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpRangeMixed {
    pub v4: IpRange<Ipv4Net>,
    pub v6: IpRange<Ipv6Net>,
}
impl From<Vec<IpNet>> for IpRangeMixed {
    fn from(value: Vec<IpNet>) -> Self {
        let (nets_v4, nets_v6) = split_nets(value);
        let mut v4 = merge_nets(nets_v4);
        v4.simplify();
        let mut v6 = merge_nets(nets_v6);
        v6.simplify();

        Self { v4, v6 }
    }
}
impl IpRangeMixed {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn merge(&self, other: &IpRangeMixed) -> Self {
        Self {
            v4: self.v4.merge(&other.v4),
            v6: self.v6.merge(&other.v6),
        }
    }

    /// True when any address of `net` falls inside the range.
    pub fn overlaps(&self, net: &IpNet) -> bool {
        match net {
            IpNet::V4(v4) => !merge_nets(vec![*v4]).intersect(&self.v4).is_empty(),
            IpNet::V6(v6) => !merge_nets(vec![*v6]).intersect(&self.v6).is_empty(),
        }
    }

    /// One address or CIDR per line, `#` starts a comment.
    pub fn parse(content: &str) -> Result<Self, anyhow::Error> {
        let mut nets = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let net = parse_address(line).with_context(|| format!("line {}", idx + 1))?;
            nets.push(net);
        }
        Ok(Self::from(nets))
    }

    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let content = read_file(path).with_context(|| format!("reading {}", path.display()))?;
        let content = String::from_utf8(content)
            .with_context(|| format!("{} is not valid UTF-8", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

fn split_nets(nets: Vec<IpNet>) -> (Vec<Ipv4Net>, Vec<Ipv6Net>) {
    let mut nets_ipv4 = Vec::new();
    let mut nets_ipv6 = Vec::new();

    for net in nets {
        match net {
            IpNet::V4(ipv4) => nets_ipv4.push(ipv4),
            IpNet::V6(ipv6) => nets_ipv6.push(ipv6),
        }
    }

    (nets_ipv4, nets_ipv6)
}

fn merge_nets<T: iprange::IpNet>(ipnets: Vec<T>) -> IpRange<T> {
    let mut ips_range = iprange::IpRange::new();
    for ipnet in ipnets {
        ips_range.add(ipnet);
    }
    ips_range
}
