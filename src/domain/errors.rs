//! Domain Errors
//!
//! Error types shared between the use cases and the adapters.

use crate::domain::value_objects::SessionId;

/// Failure reported by a cloud provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("instance {0} not found")]
    NotFound(u64),
    #[error("provider rejected credentials")]
    Unauthorized,
    #[error("provider API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Deleting something that is already gone counts as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Failure reading or writing the registry snapshot.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors surfaced by the lifecycle manager to its callers.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// No live record for the session (also covers records that expired mid-request)
    #[error("no instance found for session {0}")]
    NotFound(SessionId),
    #[error("no tracked session for instance {0}")]
    InstanceNotFound(u64),
    #[error("session {session_id} already serves application {application}")]
    Conflict {
        session_id: SessionId,
        application: String,
    },
    #[error("failed to provision {application}: {reason}")]
    ProvisionFailed { application: String, reason: String },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("application {0} not found")]
    InvalidApplication(String),
}
