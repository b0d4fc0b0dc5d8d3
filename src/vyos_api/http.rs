use std::time::Duration;

use ipnet::IpNet;
use reqwest::multipart::Form;
use reqwest::{Client, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use tracing::instrument;

use crate::metrics::OUTGOING_REQUESTS_COUNTER;
use crate::USER_AGENT;

use super::interface::VyosApi;
use super::types::{group_get, VyosCommandResponse, VyosConfigCommand, VyosSaveCommand};

#[derive(Debug)]
pub struct VyosClient {
    client: Client,
    host: Url,
    apikey: String,
}

impl VyosClient {
    pub fn new(host: Url, apikey: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(true)
            .use_rustls_tls()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            host,
            apikey,
        })
    }
}

impl VyosClient {
    fn url(&self, path: &str) -> Result<Url, anyhow::Error> {
        Ok(self.host.join(path)?)
    }

    async fn send<T: DeserializeOwned, P: Serialize>(
        &self,
        path: &str,
        payload: P,
        timeout: Option<Duration>,
    ) -> Result<T, anyhow::Error> {
        let url = self.url(path)?;

        let form = Form::new()
            .text("key", self.apikey.clone())
            .text("data", serde_json::to_string(&payload)?);

        let req = self.client.post(url).multipart(form);
        let req = if let Some(duration) = timeout {
            req.timeout(duration)
        } else {
            req
        };

        let resp = req.send().await?;
        OUTGOING_REQUESTS_COUNTER
            .with_label_values(&["VYOS", path])
            .inc();

        match resp.error_for_status_ref() {
            Ok(_) => Ok(resp.json().await?),
            Err(err) => {
                if err.status() == Some(StatusCode::BAD_REQUEST) {
                    Err(anyhow::anyhow!(resp.json::<serde_json::Value>().await?))
                } else {
                    Err(anyhow::Error::from(err))
                }
            }
        }
    }
}

/// VyOS answers 400 when asked for a config node that does not exist.
fn is_empty_path(err: &anyhow::Error) -> bool {
    err.to_string().contains("specified path is empty")
}

impl VyosApi for VyosClient {
    #[instrument(skip(self, commands, timeout))]
    async fn set_firewall_groups(
        &self,
        commands: &[VyosConfigCommand<'_>],
        timeout: Option<Duration>,
    ) -> Result<(), anyhow::Error> {
        self.send::<serde_json::Value, _>("/configure", commands, timeout)
            .await?;
        Ok(())
    }
    #[instrument(skip(self, timeout))]
    async fn save_config(&self, timeout: Option<Duration>) -> Result<(), anyhow::Error> {
        self.send::<serde_json::Value, _>("/config-file", VyosSaveCommand::default(), timeout)
            .await?;
        Ok(())
    }
    #[instrument(skip(self))]
    async fn retrieve_network_group(
        &self,
        group_name: &str,
        net: &IpNet,
    ) -> Result<Vec<IpNet>, anyhow::Error> {
        let response = self
            .send::<VyosCommandResponse<Vec<IpNet>>, _>(
                "/retrieve",
                group_get(group_name, net),
                None,
            )
            .await;
        match response {
            Ok(response) => Ok(response.data),
            Err(err) if is_empty_path(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}
