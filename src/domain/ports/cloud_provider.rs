//! Cloud Provider Port
//!
//! Defines the interface for provisioning and tearing down instances.
//! The REST binding lives in the outbound adapters.

use crate::domain::entities::{CreateInstanceRequest, ProviderInstance};
use crate::domain::errors::ProviderError;
use async_trait::async_trait;

/// Capability to manage instances at a cloud provider.
///
/// Every method is a network call. Callers treat [`ProviderError::NotFound`]
/// from `delete` as success.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create a new instance by cloning a template image.
    async fn create(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<ProviderInstance, ProviderError>;

    /// Delete an instance.
    async fn delete(&self, id: u64) -> Result<(), ProviderError>;

    /// Fetch the current state of an instance.
    async fn get(&self, id: u64) -> Result<ProviderInstance, ProviderError>;

    /// Reboot an instance.
    async fn reboot(&self, id: u64) -> Result<(), ProviderError>;

    /// List instances managed by this broker.
    async fn list(&self) -> Result<Vec<ProviderInstance>, ProviderError>;
}
