//! In-Memory Snapshot Store
//!
//! Keeps the last saved snapshot in memory. Used when no state path is
//! configured and by tests.

use crate::domain::errors::StoreError;
use crate::domain::ports::{RegistrySnapshot, SnapshotStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct InMemoryStore {
    snapshot: Mutex<Option<RegistrySnapshot>>,
    saves: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously saved snapshot.
    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Last saved snapshot.
    pub fn current(&self) -> Option<RegistrySnapshot> {
        self.snapshot.lock().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SnapshotStore for InMemoryStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>, StoreError> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
        *self.snapshot.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
