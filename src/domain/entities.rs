//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the instance broker:
//! the per-client instance record kept in the registry and the view of
//! a provisioned machine reported by the cloud provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One live allocation of a cloud instance to a client.
///
/// The record is keyed by session id in the registry. While creation is in
/// flight the record is a placeholder: `instance_id` is `None` and `address`
/// is empty. `address` is only back-filled once the provider reports the
/// instance as active with a public IPv4.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Provider-assigned instance id (absent while pending)
    #[serde(default)]
    pub instance_id: Option<u64>,
    /// Application template this instance serves
    pub application: String,
    /// Public address of the instance (empty until allocated)
    #[serde(default)]
    pub address: String,
    /// Port the application listens on
    pub port: u16,
    /// Client network address that requested the instance
    pub owner_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Create a placeholder record for a creation that has not reached the provider yet.
    pub fn pending(
        application: impl Into<String>,
        port: u16,
        owner_address: impl Into<String>,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            instance_id: None,
            application: application.into(),
            address: String::new(),
            port,
            owner_address: owner_address.into(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether the record is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Whether the provider has accepted the creation request.
    pub fn is_provisioned(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Whether the instance is reachable.
    ///
    /// The address is only written after the provider reported the
    /// instance as active, so a populated address implies readiness.
    pub fn is_ready(&self) -> bool {
        self.is_provisioned() && !self.address.is_empty()
    }

    /// URL the client should be redirected to once ready.
    pub fn redirect_target(&self) -> Option<String> {
        self.is_ready()
            .then(|| format!("http://{}:{}", self.address, self.port))
    }

    /// Merge a partial update into this record.
    pub fn apply(&mut self, patch: RecordPatch) {
        if let Some(instance_id) = patch.instance_id {
            self.instance_id = Some(instance_id);
        }
        if let Some(address) = patch.address {
            self.address = address;
        }
        if let Some(expires_at) = patch.expires_at {
            self.expires_at = expires_at;
        }
    }
}

/// Partial update for an [`InstanceRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub instance_id: Option<u64>,
    pub address: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RecordPatch {
    pub fn instance_id(id: u64) -> Self {
        Self {
            instance_id: Some(id),
            ..Self::default()
        }
    }

    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn expires_at(at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(at),
            ..Self::default()
        }
    }
}

/// Lifecycle status reported by the provider.
///
/// Only [`InstanceStatus::Active`] counts as ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceStatus {
    New,
    Active,
    Off,
    Archive,
    Other(String),
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Off => "off",
            Self::Archive => "archive",
            Self::Other(s) => s.as_str(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl From<String> for InstanceStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "new" => Self::New,
            "active" => Self::Active,
            "off" => Self::Off,
            "archive" => Self::Archive,
            _ => Self::Other(s),
        }
    }
}

impl From<InstanceStatus> for String {
    fn from(status: InstanceStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an address is reachable from the internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressVisibility {
    Public,
    Private,
}

/// One network address attached to a provider instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub ip: String,
    pub visibility: AddressVisibility,
}

/// A machine as reported by the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub id: u64,
    pub name: String,
    pub status: InstanceStatus,
    pub addresses: Vec<NetworkAddress>,
    pub region: Option<String>,
    pub size: Option<String>,
    pub created_at: Option<String>,
}

impl ProviderInstance {
    /// First public IPv4 address, if one has been allocated.
    pub fn public_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.visibility == AddressVisibility::Public && !a.ip.is_empty())
            .map(|a| a.ip.as_str())
    }
}

/// Parameters for creating an instance from a template image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    pub template_id: u64,
    pub name: String,
    pub region: String,
    pub size: String,
}
