//! instance-broker Library
//!
//! Hands each visitor a short-lived cloud instance of the application they
//! asked for: one instance per client address, created on first visit,
//! reclaimed after its TTL. Exposed as a library for the binary and for
//! integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{ClientRegistry, LifecycleManager, LifecyclePolicy, PollStatus, ResolveState};
pub use config::load_config;
pub use domain::entities::{InstanceRecord, ProviderInstance};
pub use domain::errors::{LifecycleError, ProviderError, StoreError};
pub use domain::ports::{Clock, CloudProvider, SnapshotStore};
pub use domain::value_objects::{ApplicationCatalog, ApplicationTemplate, SessionId};
