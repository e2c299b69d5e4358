//! Snapshot Store Port
//!
//! Durable storage for the client registry. The whole registry is read at
//! startup and rewritten on every mutation.

use crate::domain::entities::InstanceRecord;
use crate::domain::errors::StoreError;
use crate::domain::value_objects::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted form of the registry: the canonical session map and the
/// address index over it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, InstanceRecord>,
    #[serde(default)]
    pub addresses: BTreeMap<String, SessionId>,
}

/// Storage for registry snapshots.
///
/// Calls are synchronous: the registry writes while holding its lock so
/// the stored document always reflects a linearizable state.
pub trait SnapshotStore: Send + Sync {
    /// Load the last saved snapshot, `Ok(None)` if nothing was ever saved.
    fn load(&self) -> Result<Option<RegistrySnapshot>, StoreError>;

    /// Replace the stored snapshot.
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError>;
}
