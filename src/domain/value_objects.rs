//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque client session identifier.
///
/// Sessions are minted by the broker (UUID v4) and handed to the client
/// as a cookie. They are independent of the client's network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a client network address for use as an index key.
///
/// Strips the IPv4-mapped IPv6 prefix so `::ffff:1.2.3.4` and `1.2.3.4`
/// identify the same client. Empty input maps to `"unknown"`.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed
        .strip_prefix("::ffff:")
        .unwrap_or(trimmed)
        .to_string()
}

/// Static description of how to build an instance for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationTemplate {
    /// Provider image (snapshot) id to clone
    pub template_id: u64,
    /// Provider region slug
    pub region: String,
    /// Provider size slug
    pub size: String,
    /// Port the application listens on inside the instance
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    80
}

/// Read-only set of application templates keyed by application name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationCatalog {
    templates: HashMap<String, ApplicationTemplate>,
}

impl ApplicationCatalog {
    pub fn new(templates: HashMap<String, ApplicationTemplate>) -> Self {
        Self { templates }
    }

    pub fn get(&self, application: &str) -> Option<&ApplicationTemplate> {
        self.templates.get(application)
    }

    pub fn contains(&self, application: &str) -> bool {
        self.templates.contains_key(application)
    }

    /// Application names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl FromIterator<(String, ApplicationTemplate)> for ApplicationCatalog {
    fn from_iter<I: IntoIterator<Item = (String, ApplicationTemplate)>>(iter: I) -> Self {
        Self {
            templates: iter.into_iter().collect(),
        }
    }
}
