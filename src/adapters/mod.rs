//! Adapters Layer
//!
//! Inbound adapters drive the use cases (HTTP gateway); outbound adapters
//! implement the domain ports (cloud provider, snapshot storage).

pub mod inbound;
pub mod outbound;
