//! JSON File Store
//!
//! Implements SnapshotStore as a single pretty-printed JSON document.
//! Writes go to a sibling temp file first and are renamed into place so a
//! crash mid-write never leaves a truncated snapshot behind.

use crate::domain::errors::StoreError;
use crate::domain::ports::{RegistrySnapshot, SnapshotStore};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// File-backed snapshot store.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_slice(&bytes)?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::InstanceRecord;
    use crate::domain::value_objects::SessionId;
    use chrono::Utc;

    fn snapshot() -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::default();
        let ttl = chrono::Duration::hours(1);
        let mut record = InstanceRecord::pending("app1", 5004, "1.2.3.4", Utc::now(), ttl);
        record.instance_id = Some(99);
        snapshot.sessions.insert(SessionId::from("s1"), record);
        snapshot
            .addresses
            .insert("1.2.3.4".to_string(), SessionId::from("s1"));
        snapshot
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions.json"));

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions.json"));

        let saved = snapshot();

        store.save(&saved).unwrap();

        assert_eq!(store.load().unwrap(), Some(saved));
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("data").join("sessions.json"));

        store.save(&RegistrySnapshot::default()).unwrap();

        assert!(store.path().exists());
        assert!(!dir.path().join("data").join("sessions.json.tmp").exists());
    }

    #[test]
    fn test_document_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions.json"));
        store.save(&snapshot()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();

        assert_eq!(raw["addresses"]["1.2.3.4"], "s1");
        assert_eq!(raw["sessions"]["s1"]["instance_id"], 99);
        assert_eq!(raw["sessions"]["s1"]["application"], "app1");
        assert_eq!(raw["sessions"]["s1"]["owner_address"], "1.2.3.4");
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "[1, 2").unwrap();

        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_empty_object_loads_as_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{}").unwrap();

        let loaded = JsonFileStore::new(&path).load().unwrap().unwrap();
        assert!(loaded.sessions.is_empty());
        assert!(loaded.addresses.is_empty());
    }
}
