//! Application Layer
//!
//! Use cases built on the domain ports.

pub mod client_registry;
pub mod lifecycle_manager;

pub use client_registry::{Claim, ClientRegistry};
pub use lifecycle_manager::{
    AdminDeletion, LifecycleManager, LifecyclePolicy, ManagedInstance, PollStatus, Resolution,
    ResolveState, SweepReport, SwitchOutcome,
};
