use std::future::Future;
use std::time::Duration;

use ipnet::IpNet;

use super::types::VyosConfigCommand;

pub trait VyosApi {
    fn set_firewall_groups(
        &self,
        commands: &[VyosConfigCommand<'_>],
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<(), anyhow::Error>> + Send;
    fn save_config(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<(), anyhow::Error>> + Send;
    /// Members of the group for `net`'s address family; a group that was
    /// never populated has none.
    fn retrieve_network_group(
        &self,
        group_name: &str,
        net: &IpNet,
    ) -> impl Future<Output = Result<Vec<IpNet>, anyhow::Error>> + Send;
}
