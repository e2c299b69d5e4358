//! Client Registry
//!
//! Durable mapping of session -> instance record plus the address index
//! over it. Both maps live behind one lock so every operation, including
//! index maintenance, is linearizable. Each mutation is flushed to the
//! snapshot store before the lock is released.

use crate::domain::entities::{InstanceRecord, RecordPatch};
use crate::domain::ports::{RegistrySnapshot, SnapshotStore};
use crate::domain::value_objects::SessionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of [`ClientRegistry::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The address already has a live record.
    Existing {
        session_id: SessionId,
        record: InstanceRecord,
    },
    /// A placeholder was inserted and indexed; the caller owns its creation.
    Claimed {
        session_id: SessionId,
        record: InstanceRecord,
    },
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, InstanceRecord>,
    addresses: HashMap<String, SessionId>,
}

impl RegistryState {
    fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let sessions: HashMap<_, _> = snapshot.sessions.into_iter().collect();
        let mut addresses = HashMap::new();
        let mut dangling = 0usize;
        for (address, session_id) in snapshot.addresses {
            if sessions.contains_key(&session_id) {
                addresses.insert(address, session_id);
            } else {
                dangling += 1;
            }
        }
        if dangling > 0 {
            tracing::warn!("dropped {} address entries pointing at missing sessions", dangling);
        }
        Self {
            sessions,
            addresses,
        }
    }

    fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            sessions: self
                .sessions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            addresses: self
                .addresses
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Remove a record and the index entry of its owner, if that entry still points at it.
    fn remove(&mut self, session_id: &SessionId) -> Option<InstanceRecord> {
        let record = self.sessions.remove(session_id)?;
        if self.addresses.get(&record.owner_address) == Some(session_id) {
            self.addresses.remove(&record.owner_address);
        }
        Some(record)
    }
}

/// Registry of client sessions and their instances.
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
    store: Arc<dyn SnapshotStore>,
}

impl ClientRegistry {
    /// Open the registry, loading any prior state from the store.
    ///
    /// A missing snapshot starts empty. A corrupt or unreadable snapshot is
    /// logged and also starts empty; it is never fatal.
    pub fn open(store: Arc<dyn SnapshotStore>) -> Self {
        let state = match store.load() {
            Ok(Some(snapshot)) => {
                let state = RegistryState::from_snapshot(snapshot);
                tracing::info!(
                    "registry loaded sessions={} addresses={}",
                    state.sessions.len(),
                    state.addresses.len()
                );
                state
            }
            Ok(None) => {
                tracing::info!("no registry snapshot found, starting empty");
                RegistryState::default()
            }
            Err(e) => {
                tracing::warn!("failed to load registry snapshot, starting empty: {}", e);
                RegistryState::default()
            }
        };

        Self {
            state: Mutex::new(state),
            store,
        }
    }

    fn persist(&self, state: &RegistryState) {
        if let Err(e) = self.store.save(&state.snapshot()) {
            tracing::warn!("registry flush failed, continuing in memory: {}", e);
        }
    }

    /// Write the current state to the store.
    pub fn flush(&self) {
        let state = self.state.lock();
        self.persist(&state);
    }

    pub fn get(&self, session_id: &SessionId) -> Option<InstanceRecord> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    /// Resolve a record through the address index.
    pub fn get_by_address(&self, address: &str) -> Option<(SessionId, InstanceRecord)> {
        let state = self.state.lock();
        let session_id = state.addresses.get(address)?;
        state
            .sessions
            .get(session_id)
            .map(|record| (session_id.clone(), record.clone()))
    }

    /// Find the session tracking a provider instance.
    pub fn get_by_instance_id(&self, instance_id: u64) -> Option<(SessionId, InstanceRecord)> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|(_, record)| record.instance_id == Some(instance_id))
            .map(|(session_id, record)| (session_id.clone(), record.clone()))
    }

    /// Insert or replace a record.
    pub fn put(&self, session_id: SessionId, record: InstanceRecord) {
        let mut state = self.state.lock();
        state.sessions.insert(session_id, record);
        self.persist(&state);
    }

    /// Merge a partial update. Returns `false` if the session does not exist.
    pub fn update(&self, session_id: &SessionId, patch: RecordPatch) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.sessions.get_mut(session_id) else {
            return false;
        };
        record.apply(patch);
        self.persist(&state);
        true
    }

    /// Move a record's expiry to `expires_at` if it is still live at `now`.
    ///
    /// An expired record is gone as far as callers are concerned; its address
    /// may already belong to a newer session, so it must not come back.
    pub fn refresh_if_live(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.sessions.get_mut(session_id) else {
            return false;
        };
        if record.is_expired(now) {
            return false;
        }
        record.expires_at = expires_at;
        self.persist(&state);
        true
    }

    /// Remove a record and its address index entry.
    pub fn delete(&self, session_id: &SessionId) -> Option<InstanceRecord> {
        let mut state = self.state.lock();
        let removed = state.remove(session_id);
        if removed.is_some() {
            self.persist(&state);
        }
        removed
    }

    /// Remove a record only if it is still expired at `now`.
    ///
    /// A refresh that landed after the caller's check keeps the record.
    pub fn delete_if_expired(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Option<InstanceRecord> {
        let mut state = self.state.lock();
        if !state.sessions.get(session_id)?.is_expired(now) {
            return None;
        }
        let removed = state.remove(session_id);
        self.persist(&state);
        removed
    }

    /// Point an address at a session, overwriting any previous entry.
    pub fn associate(&self, address: impl Into<String>, session_id: SessionId) {
        let mut state = self.state.lock();
        state.addresses.insert(address.into(), session_id);
        self.persist(&state);
    }

    pub fn address_of(&self, address: &str) -> Option<SessionId> {
        self.state.lock().addresses.get(address).cloned()
    }

    pub fn unassociate(&self, address: &str) -> Option<SessionId> {
        let mut state = self.state.lock();
        let removed = state.addresses.remove(address);
        if removed.is_some() {
            self.persist(&state);
        }
        removed
    }

    /// Reserve creation for an address.
    ///
    /// If the address maps to a record that is live at `now`, that record is
    /// returned. Otherwise a new session is inserted with `placeholder` and
    /// the address index is overwritten to point at it, all in one critical
    /// section, so concurrent callers for the same address observe exactly
    /// one `Claimed`.
    pub fn claim(&self, address: &str, now: DateTime<Utc>, placeholder: InstanceRecord) -> Claim {
        let mut state = self.state.lock();

        if let Some(session_id) = state.addresses.get(address) {
            if let Some(record) = state.sessions.get(session_id) {
                if !record.is_expired(now) {
                    return Claim::Existing {
                        session_id: session_id.clone(),
                        record: record.clone(),
                    };
                }
            }
        }

        let session_id = SessionId::generate();
        state.sessions.insert(session_id.clone(), placeholder.clone());
        state
            .addresses
            .insert(address.to_string(), session_id.clone());
        self.persist(&state);

        Claim::Claimed {
            session_id,
            record: placeholder,
        }
    }

    /// Drop a placeholder whose creation failed.
    ///
    /// Only records that never received an instance id are removed.
    pub fn release_claim(&self, session_id: &SessionId) -> bool {
        let mut state = self.state.lock();
        match state.sessions.get(session_id) {
            Some(record) if !record.is_provisioned() => {
                state.remove(session_id);
                self.persist(&state);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every (session, record) pair.
    pub fn all(&self) -> Vec<(SessionId, InstanceRecord)> {
        self.state
            .lock()
            .sessions
            .iter()
            .map(|(session_id, record)| (session_id.clone(), record.clone()))
            .collect()
    }

    /// Snapshot of the address index.
    pub fn address_map(&self) -> Vec<(String, SessionId)> {
        self.state
            .lock()
            .addresses
            .iter()
            .map(|(address, session_id)| (address.clone(), session_id.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().sessions.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{InMemoryStore, JsonFileStore};
    use crate::domain::errors::StoreError;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(app: &str, owner: &str, instance_id: Option<u64>) -> InstanceRecord {
        let mut record =
            InstanceRecord::pending(app, 5004, owner, at(0), chrono::Duration::hours(1));
        record.instance_id = instance_id;
        record
    }

    fn registry() -> (ClientRegistry, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (ClientRegistry::open(store.clone()), store)
    }

    struct FailingStore {
        saves: AtomicUsize,
    }

    impl SnapshotStore for FailingStore {
        fn load(&self) -> Result<Option<RegistrySnapshot>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }

        fn save(&self, _snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }
    }

    // ===== Basic CRUD Tests =====

    #[test]
    fn test_put_and_get() {
        let (registry, _) = registry();
        let sid = SessionId::from("s1");

        registry.put(sid.clone(), record("demo", "1.2.3.4", Some(1)));

        let got = registry.get(&sid).unwrap();
        assert_eq!(got.application, "demo");
        assert_eq!(got.instance_id, Some(1));
        assert!(registry.get(&SessionId::from("missing")).is_none());
    }

    #[test]
    fn test_put_flushes() {
        let (registry, store) = registry();
        registry.put(SessionId::from("s1"), record("demo", "1.2.3.4", Some(1)));

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.current().unwrap().sessions.len(), 1);
    }

    #[test]
    fn test_update_merges_fields() {
        let (registry, _) = registry();
        let sid = SessionId::from("s1");
        registry.put(sid.clone(), record("demo", "1.2.3.4", Some(1)));

        assert!(registry.update(&sid, RecordPatch::address("203.0.113.9")));

        let got = registry.get(&sid).unwrap();
        assert_eq!(got.address, "203.0.113.9");
        assert_eq!(got.instance_id, Some(1));
    }

    #[test]
    fn test_update_missing_session_is_false_and_does_not_flush() {
        let (registry, store) = registry();

        assert!(!registry.update(&SessionId::from("nope"), RecordPatch::address("x")));
        assert_eq!(store.save_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_delete_removes_index_entry() {
        let (registry, _) = registry();
        let sid = SessionId::from("s1");
        registry.put(sid.clone(), record("demo", "1.2.3.4", Some(1)));
        registry.associate("1.2.3.4", sid.clone());

        let removed = registry.delete(&sid);

        assert!(removed.is_some());
        assert!(registry.get(&sid).is_none());
        assert!(registry.address_of("1.2.3.4").is_none());
    }

    #[test]
    fn test_delete_keeps_index_entry_owned_by_newer_session() {
        let (registry, _) = registry();
        let old = SessionId::from("old");
        let new = SessionId::from("new");
        registry.put(old.clone(), record("demo", "1.2.3.4", Some(1)));
        registry.put(new.clone(), record("demo", "1.2.3.4", Some(2)));
        registry.associate("1.2.3.4", new.clone());

        registry.delete(&old);

        assert_eq!(registry.address_of("1.2.3.4"), Some(new));
    }

    #[test]
    fn test_delete_missing_is_none() {
        let (registry, store) = registry();
        assert!(registry.delete(&SessionId::from("nope")).is_none());
        assert_eq!(store.save_count(), 0);
    }

    // ===== Index Tests =====

    #[test]
    fn test_get_by_address() {
        let (registry, _) = registry();
        let sid = SessionId::from("s1");
        registry.put(sid.clone(), record("demo", "1.2.3.4", Some(1)));
        registry.associate("1.2.3.4", sid.clone());

        let (found_sid, found) = registry.get_by_address("1.2.3.4").unwrap();
        assert_eq!(found_sid, sid);
        assert_eq!(found.application, "demo");
        assert!(registry.get_by_address("5.6.7.8").is_none());
    }

    #[test]
    fn test_associate_overwrites_stale_entry() {
        let (registry, _) = registry();
        registry.associate("1.2.3.4", SessionId::from("a"));
        registry.associate("1.2.3.4", SessionId::from("b"));

        assert_eq!(registry.address_of("1.2.3.4"), Some(SessionId::from("b")));
        assert_eq!(registry.address_map().len(), 1);
    }

    #[test]
    fn test_unassociate() {
        let (registry, _) = registry();
        registry.associate("1.2.3.4", SessionId::from("a"));

        assert_eq!(registry.unassociate("1.2.3.4"), Some(SessionId::from("a")));
        assert_eq!(registry.unassociate("1.2.3.4"), None);
    }

    #[test]
    fn test_get_by_instance_id() {
        let (registry, _) = registry();
        registry.put(SessionId::from("s1"), record("demo", "1.2.3.4", Some(11)));
        registry.put(SessionId::from("s2"), record("other", "5.6.7.8", Some(22)));
        registry.put(SessionId::from("s3"), record("other", "9.9.9.9", None));

        let (sid, found) = registry.get_by_instance_id(22).unwrap();
        assert_eq!(sid, SessionId::from("s2"));
        assert_eq!(found.application, "other");
        assert!(registry.get_by_instance_id(33).is_none());
    }

    // ===== Claim Tests =====

    #[test]
    fn test_claim_inserts_placeholder_and_index() {
        let (registry, store) = registry();

        let claim = registry.claim("1.2.3.4", at(0), record("demo", "1.2.3.4", None));

        let Claim::Claimed { session_id, record } = claim else {
            panic!("expected a fresh claim");
        };
        assert!(record.instance_id.is_none());
        assert_eq!(registry.address_of("1.2.3.4"), Some(session_id.clone()));
        assert_eq!(registry.get(&session_id), Some(record));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_second_claim_returns_existing() {
        let (registry, _) = registry();

        let first = registry.claim("1.2.3.4", at(0), record("demo", "1.2.3.4", None));
        let second = registry.claim("1.2.3.4", at(10), record("demo", "1.2.3.4", None));

        let Claim::Claimed { session_id: first_sid, .. } = first else {
            panic!("expected a fresh claim");
        };
        match second {
            Claim::Existing { session_id, .. } => assert_eq!(session_id, first_sid),
            other => panic!("expected existing, got {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_claim_overwrites_expired_owner() {
        let (registry, _) = registry();
        let Claim::Claimed { session_id: old, .. } =
            registry.claim("1.2.3.4", at(0), record("demo", "1.2.3.4", None))
        else {
            panic!("expected a fresh claim");
        };

        // One second past the one hour TTL
        let claim = registry.claim("1.2.3.4", at(3601), record("demo", "1.2.3.4", None));

        let Claim::Claimed { session_id: new, .. } = claim else {
            panic!("expired owner should not block a new claim");
        };
        assert_ne!(old, new);
        assert_eq!(registry.address_of("1.2.3.4"), Some(new));
        // The expired record stays until the sweep reclaims it.
        assert!(registry.get(&old).is_some());
    }

    #[test]
    fn test_claim_ignores_dangling_index_entry() {
        let (registry, _) = registry();
        registry.associate("1.2.3.4", SessionId::from("ghost"));

        let claim = registry.claim("1.2.3.4", at(0), record("demo", "1.2.3.4", None));

        assert!(matches!(claim, Claim::Claimed { .. }));
    }

    #[test]
    fn test_release_claim_only_removes_placeholders() {
        let (registry, _) = registry();
        let Claim::Claimed { session_id, .. } =
            registry.claim("1.2.3.4", at(0), record("demo", "1.2.3.4", None))
        else {
            panic!("expected a fresh claim");
        };

        registry.update(&session_id, RecordPatch::instance_id(5));
        assert!(!registry.release_claim(&session_id));
        assert!(registry.get(&session_id).is_some());

        let Claim::Claimed { session_id: other, .. } =
            registry.claim("5.6.7.8", at(0), record("demo", "5.6.7.8", None))
        else {
            panic!("expected a fresh claim");
        };
        assert!(registry.release_claim(&other));
        assert!(registry.get(&other).is_none());
        assert!(registry.address_of("5.6.7.8").is_none());
    }

    // ===== delete_if_expired Tests =====

    #[test]
    fn test_delete_if_expired() {
        let (registry, _) = registry();
        let sid = SessionId::from("s1");
        registry.put(sid.clone(), record("demo", "1.2.3.4", Some(1)));
        registry.associate("1.2.3.4", sid.clone());

        assert!(registry.delete_if_expired(&sid, at(100)).is_none());
        assert!(registry.get(&sid).is_some());

        assert!(registry.delete_if_expired(&sid, at(3601)).is_some());
        assert!(registry.get(&sid).is_none());
        assert!(registry.address_of("1.2.3.4").is_none());
    }

    #[test]
    fn test_refresh_if_live_extends_live_record() {
        let (registry, store) = registry();
        let sid = SessionId::from("s1");
        registry.put(sid.clone(), record("demo", "1.2.3.4", Some(1)));

        assert!(registry.refresh_if_live(&sid, at(600), at(4200)));

        assert_eq!(registry.get(&sid).unwrap().expires_at, at(4200));
        assert_eq!(store.save_count(), 2);
    }

    #[test]
    fn test_refresh_if_live_rejects_expired_record() {
        let (registry, store) = registry();
        let sid = SessionId::from("s1");
        registry.put(sid.clone(), record("demo", "1.2.3.4", Some(1)));

        assert!(!registry.refresh_if_live(&sid, at(3601), at(7201)));
        assert!(!registry.refresh_if_live(&SessionId::from("nope"), at(0), at(3600)));

        assert_eq!(registry.get(&sid).unwrap().expires_at, at(3600));
        assert_eq!(store.save_count(), 1);
    }

    // ===== Durability Tests =====

    #[test]
    fn test_reload_roundtrip_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let registry = ClientRegistry::open(Arc::new(JsonFileStore::new(&path)));
        let Claim::Claimed { session_id, .. } =
            registry.claim("1.2.3.4", at(0), record("demo", "1.2.3.4", None))
        else {
            panic!("expected a fresh claim");
        };
        registry.update(&session_id, RecordPatch::instance_id(181789519));
        registry.put(SessionId::from("solo"), record("other", "5.6.7.8", Some(2)));

        let reloaded = ClientRegistry::open(Arc::new(JsonFileStore::new(&path)));

        let mut before = registry.all();
        let mut after = reloaded.all();
        before.sort_by(|a, b| a.0.cmp(&b.0));
        after.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(before, after);

        let mut before_idx = registry.address_map();
        let mut after_idx = reloaded.address_map();
        before_idx.sort();
        after_idx.sort();
        assert_eq!(before_idx, after_idx);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{ not json").unwrap();

        let registry = ClientRegistry::open(Arc::new(JsonFileStore::new(&path)));

        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            ClientRegistry::open(Arc::new(JsonFileStore::new(dir.path().join("absent.json"))));

        assert!(registry.is_empty());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_load_drops_dangling_index_entries() {
        let mut sessions = BTreeMap::new();
        sessions.insert(SessionId::from("s1"), record("demo", "1.2.3.4", Some(1)));
        let mut addresses = BTreeMap::new();
        addresses.insert("1.2.3.4".to_string(), SessionId::from("s1"));
        addresses.insert("9.9.9.9".to_string(), SessionId::from("gone"));
        let store = Arc::new(InMemoryStore::with_snapshot(RegistrySnapshot {
            sessions,
            addresses,
        }));

        let registry = ClientRegistry::open(store);

        assert_eq!(registry.address_map(), vec![("1.2.3.4".to_string(), SessionId::from("s1"))]);
        assert!(logs_contain("dropped 1 address entries"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_failing_store_degrades_to_memory() {
        let store = Arc::new(FailingStore {
            saves: AtomicUsize::new(0),
        });
        let registry = ClientRegistry::open(store.clone());
        let sid = SessionId::from("s1");

        registry.put(sid.clone(), record("demo", "1.2.3.4", Some(1)));
        assert!(registry.update(&sid, RecordPatch::address("203.0.113.1")));

        assert_eq!(registry.get(&sid).unwrap().address, "203.0.113.1");
        assert_eq!(store.saves.load(Ordering::SeqCst), 2);
        assert!(logs_contain("failed to load registry snapshot"));
        assert!(logs_contain("registry flush failed, continuing in memory"));
    }

    #[test]
    fn test_flush_writes_current_state() {
        let (registry, store) = registry();
        registry.put(SessionId::from("s1"), record("demo", "1.2.3.4", Some(1)));

        registry.flush();

        assert_eq!(store.save_count(), 2);
        assert!(store
            .current()
            .unwrap()
            .sessions
            .contains_key(&SessionId::from("s1")));
    }
}
