//! DigitalOcean Cloud Provider
//!
//! Implements CloudProvider against the DigitalOcean v2 REST API.
//! Instances are droplets cloned from a snapshot image.
//!
//! See: https://docs.digitalocean.com/reference/api/api-reference/#tag/Droplets

use crate::domain::entities::{
    AddressVisibility, CreateInstanceRequest, InstanceStatus, NetworkAddress, ProviderInstance,
};
use crate::domain::errors::ProviderError;
use crate::domain::ports::CloudProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tag put on every droplet created by the broker; listing filters on it.
const MANAGED_TAG: &str = "temporary";

/// Configuration for the DigitalOcean API.
#[derive(Debug, Clone)]
pub struct DigitalOceanConfig {
    /// Base URL including the version segment (e.g., "https://api.digitalocean.com/v2")
    pub api_url: String,
    /// Personal access token
    pub token: String,
    /// SSH key ids installed on new droplets
    pub ssh_key_ids: Vec<u64>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for DigitalOceanConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.digitalocean.com/v2".to_string(),
            token: String::new(),
            ssh_key_ids: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateDropletBody<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: u64,
    ssh_keys: &'a [u64],
    tags: [&'a str; 2],
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletsEnvelope {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    networks: Networks,
    #[serde(default)]
    region: Option<Slug>,
    #[serde(default)]
    size_slug: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<V4Network>,
}

#[derive(Debug, Deserialize)]
struct V4Network {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Slug {
    slug: String,
}

impl From<Droplet> for ProviderInstance {
    fn from(d: Droplet) -> Self {
        let addresses = d
            .networks
            .v4
            .into_iter()
            .map(|n| NetworkAddress {
                ip: n.ip_address,
                visibility: if n.kind == "public" {
                    AddressVisibility::Public
                } else {
                    AddressVisibility::Private
                },
            })
            .collect();

        Self {
            id: d.id,
            name: d.name,
            status: InstanceStatus::from(d.status),
            addresses,
            region: d.region.map(|r| r.slug),
            size: d.size_slug,
            created_at: d.created_at,
        }
    }
}

/// DigitalOcean-backed cloud provider.
pub struct DigitalOceanProvider {
    config: DigitalOceanConfig,
    client: reqwest::Client,
}

impl DigitalOceanProvider {
    pub fn new(config: DigitalOceanConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// Send a request and map non-success statuses onto ProviderError.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        id: Option<u64>,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = request
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match (status.as_u16(), id) {
            (404, Some(id)) => Err(ProviderError::NotFound(id)),
            (401 | 403, _) => Err(ProviderError::Unauthorized),
            (code, _) => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Api { status: code, body })
            }
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    async fn create(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<ProviderInstance, ProviderError> {
        let body = CreateDropletBody {
            name: &request.name,
            region: &request.region,
            size: &request.size,
            image: request.template_id,
            ssh_keys: &self.config.ssh_key_ids,
            tags: ["cloned", MANAGED_TAG],
        };

        let response = self
            .send(self.client.post(self.url("/droplets")).json(&body), None)
            .await?;
        let envelope: DropletEnvelope = Self::decode(response).await?;

        tracing::debug!(
            "droplet {} created from image {} in {}",
            envelope.droplet.id,
            request.template_id,
            request.region
        );
        Ok(envelope.droplet.into())
    }

    async fn delete(&self, id: u64) -> Result<(), ProviderError> {
        self.send(
            self.client.delete(self.url(&format!("/droplets/{}", id))),
            Some(id),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<ProviderInstance, ProviderError> {
        let response = self
            .send(
                self.client.get(self.url(&format!("/droplets/{}", id))),
                Some(id),
            )
            .await?;
        let envelope: DropletEnvelope = Self::decode(response).await?;
        Ok(envelope.droplet.into())
    }

    async fn reboot(&self, id: u64) -> Result<(), ProviderError> {
        self.send(
            self.client
                .post(self.url(&format!("/droplets/{}/actions", id)))
                .json(&serde_json::json!({ "type": "reboot" })),
            Some(id),
        )
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProviderInstance>, ProviderError> {
        let response = self
            .send(
                self.client
                    .get(self.url("/droplets"))
                    .query(&[("tag_name", MANAGED_TAG), ("per_page", "200")]),
                None,
            )
            .await?;
        let envelope: DropletsEnvelope = Self::decode(response).await?;
        Ok(envelope.droplets.into_iter().map(Into::into).collect())
    }
}
