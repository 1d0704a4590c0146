//! Minimal Hetzner Cloud client: the three server operations the fleet
//! manager needs, over the public v1 REST API.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const DEFAULT_API_URL: &str = "https://api.hetzner.cloud/v1";

/// Parameters for one new build VM.
#[derive(Debug, Clone)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_key: Option<String>,
    pub user_data: String,
}

/// The subset of a provider server record the controller keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudServer {
    pub id: i64,
    pub name: String,
    pub ipv4: String,
    pub ipv6: String,
}

/// Cloud VM operations, behind a trait so the fleet manager can run
/// against a fake provider in tests.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_server(&self, request: &CreateServerRequest) -> Result<CloudServer>;

    /// `Ok(None)` when the server does not exist (any more).
    async fn get_server(&self, id: i64) -> Result<Option<CloudServer>>;

    /// Deleting a server that is already gone is a success.
    async fn delete_server(&self, id: i64) -> Result<()>;
}

pub struct HetznerClient {
    http: reqwest::Client,
    token: String,
    api_url: String,
}

impl HetznerClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Ok(HetznerClient {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .context("failed to build HTTP client")?,
            token: token.into(),
            api_url: DEFAULT_API_URL.to_string(),
        })
    }
}

#[async_trait]
impl CloudProvider for HetznerClient {
    async fn create_server(&self, request: &CreateServerRequest) -> Result<CloudServer> {
        let body = ApiCreateServer {
            name: &request.name,
            server_type: &request.server_type,
            image: &request.image,
            location: &request.location,
            ssh_keys: request.ssh_key.clone().into_iter().collect(),
            user_data: &request.user_data,
            start_after_create: true,
        };
        let response = self
            .http
            .post(format!("{}/servers", self.api_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("failed to reach cloud API")?;
        if !response.status().is_success() {
            bail!(
                "cloud API rejected server creation with status {}",
                response.status()
            );
        }
        let created: ApiServerEnvelope = response
            .json()
            .await
            .context("malformed cloud API response")?;
        Ok(created.server.into())
    }

    async fn get_server(&self, id: i64) -> Result<Option<CloudServer>> {
        let response = self
            .http
            .get(format!("{}/servers/{id}", self.api_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to reach cloud API")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("cloud API returned status {}", response.status());
        }
        let envelope: ApiServerEnvelope = response
            .json()
            .await
            .context("malformed cloud API response")?;
        Ok(Some(envelope.server.into()))
    }

    async fn delete_server(&self, id: i64) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/servers/{id}", self.api_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to reach cloud API")?;
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        bail!(
            "cloud API refused to delete server {id}: status {}",
            response.status()
        );
    }
}

#[derive(Serialize)]
struct ApiCreateServer<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    location: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_keys: Vec<String>,
    user_data: &'a str,
    start_after_create: bool,
}

#[derive(Deserialize)]
struct ApiServerEnvelope {
    server: ApiServer,
}

#[derive(Deserialize)]
struct ApiServer {
    id: i64,
    name: String,
    #[serde(default)]
    public_net: ApiPublicNet,
}

#[derive(Default, Deserialize)]
struct ApiPublicNet {
    #[serde(default)]
    ipv4: Option<ApiIp>,
    #[serde(default)]
    ipv6: Option<ApiIp>,
}

#[derive(Deserialize)]
struct ApiIp {
    ip: String,
}

impl From<ApiServer> for CloudServer {
    fn from(server: ApiServer) -> Self {
        CloudServer {
            id: server.id,
            name: server.name,
            ipv4: server.public_net.ipv4.map(|v| v.ip).unwrap_or_default(),
            ipv6: server.public_net.ipv6.map(|v| v.ip).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_response_maps_ip_families() {
        let json = r#"{
            "server": {
                "id": 4711,
                "name": "worker-2021-01-01-00-00-00",
                "public_net": {
                    "ipv4": {"ip": "192.0.2.10"},
                    "ipv6": {"ip": "2001:db8::1"}
                }
            }
        }"#;
        let envelope: ApiServerEnvelope = serde_json::from_str(json).unwrap();
        let server: CloudServer = envelope.server.into();
        assert_eq!(
            server,
            CloudServer {
                id: 4711,
                name: "worker-2021-01-01-00-00-00".into(),
                ipv4: "192.0.2.10".into(),
                ipv6: "2001:db8::1".into(),
            }
        );
    }

    #[test]
    fn missing_public_net_yields_empty_addresses() {
        let json = r#"{"server": {"id": 1, "name": "w"}}"#;
        let envelope: ApiServerEnvelope = serde_json::from_str(json).unwrap();
        let server: CloudServer = envelope.server.into();
        assert_eq!(server.ipv4, "");
        assert_eq!(server.ipv6, "");
    }
}
