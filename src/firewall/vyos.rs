use std::time::Duration;

use ipnet::IpNet;
use reqwest::Url;
use tracing::{debug, instrument};

use super::FirewallBackend;
use crate::error::BackendError;
use crate::vyos_api::{NetSet, VyosApi, VyosClient, VyosConfigOperation};

const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Members of a VyOS firewall network-group, driven over the HTTP API.
#[derive(Debug)]
pub struct VyosBackend<A = VyosClient> {
    api: A,
    group: String,
    save: bool,
}

impl VyosBackend {
    pub fn new(host: Url, apikey: String, group: String, save: bool) -> Result<Self, BackendError> {
        let api = VyosClient::new(host, apikey)
            .map_err(|err| BackendError::Config(format!("vyos client: {err}")))?;
        Ok(Self::with_api(api, group, save))
    }
}

impl<A: VyosApi> VyosBackend<A> {
    pub fn with_api(api: A, group: String, save: bool) -> Self {
        Self { api, group, save }
    }

    async fn is_member(&self, net: IpNet) -> Result<bool, BackendError> {
        let members = self
            .api
            .retrieve_network_group(&self.group, &net)
            .await
            .map_err(api_error)?;
        Ok(members.contains(&net))
    }

    async fn configure(&self, op: VyosConfigOperation, net: IpNet) -> Result<(), BackendError> {
        let nets = [net];
        let commands = NetSet(&nets).into_vyos_commands(op, &self.group);
        debug!(msg = "Updating firewall group", ?commands);
        self.api
            .set_firewall_groups(&commands, Some(CONFIGURE_TIMEOUT))
            .await
            .map_err(api_error)?;
        if self.save {
            self.api
                .save_config(Some(CONFIGURE_TIMEOUT))
                .await
                .map_err(api_error)?;
        }
        Ok(())
    }
}

fn api_error(err: anyhow::Error) -> BackendError {
    BackendError::Api(format!("{err:#}"))
}

impl<A: VyosApi + Send + Sync> FirewallBackend for VyosBackend<A> {
    fn name(&self) -> &'static str {
        "vyos"
    }

    // `set` of an existing member is accepted by VyOS as is
    #[instrument(skip(self))]
    async fn apply(&self, net: IpNet) -> Result<(), BackendError> {
        self.configure(VyosConfigOperation::Set, net).await
    }

    #[instrument(skip(self))]
    async fn remove(&self, net: IpNet) -> Result<(), BackendError> {
        if !self.is_member(net).await? {
            return Ok(());
        }
        self.configure(VyosConfigOperation::Delete, net).await
    }
}
