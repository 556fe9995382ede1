//! Backup store (C10): sequentially-numbered, append-only write/snapshot records
//! on disk.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// What kind of event a [`BackupRecord`] captures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// A before/after record of a DID write (revertable).
    DidWrite,
    /// A point-in-time read, not tied to a write (not revertable).
    DidSnapshot,
}

/// A single persisted backup record. No wall-clock timestamp is recorded --
/// determinism is required for regression tests ( non-goals).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Zero-padded 6-digit decimal id, e.g. `"000001"`.
    pub backup_id: String,
    /// Which kind of record this is.
    pub kind: BackupKind,
    /// ECU address the record was captured against.
    pub ecu: String,
    /// DID the record was captured against.
    pub did: u16,
    /// Dataset key, if this backup was created by the adaptations/long-coding
    /// engine rather than a raw DID backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Uppercase hex of the bytes read immediately before the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_hex: Option<String>,
    /// Uppercase hex of the bytes that were written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hex: Option<String>,
    /// Uppercase hex of a plain snapshot read (kind == [`BackupKind::DidSnapshot`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_hex: Option<String>,
    /// Free-text notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Errors raised by the backup store.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// The underlying filesystem operation failed.
    #[error("backup store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A record file existed but was not valid JSON.
    #[error("invalid backup record {0:?}: {1}")]
    InvalidRecord(String, serde_json::Error),
    /// No record exists for the requested id.
    #[error("unknown backup id: {0:?}")]
    UnknownId(String),
    /// A record or index line failed to serialize (should not happen for this
    /// crate's own data model, but `serde_json::Error` is fallible to call).
    #[error("backup store serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The append-only backup record store. Root directory holds one
/// `<backup_id>.json` per record plus an `index.jsonl` append log used to derive
/// the next id.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

const TAIL_READ_BYTES: u64 = 4096;

impl BackupStore {
    /// Binds a store to `root`, creating the directory if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BackupError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.jsonl")
    }

    fn record_path(&self, backup_id: &str) -> PathBuf {
        self.root.join(format!("{backup_id}.json"))
    }

    /// Derives the next backup id by reading a bounded trailing chunk of
    /// `index.jsonl` and parsing its last complete line. A missing or
    /// unparsable index means "no backups yet" (`next = 1`), never an error.
    fn next_id(&self) -> String {
        let last = self.last_index_entry().and_then(|line| {
            serde_json::from_str::<IndexEntry>(&line).ok().map(|e| e.backup_id)
        });
        let next_n: u32 = match last {
            Some(id) => id.parse::<u32>().unwrap_or(0) + 1,
            None => 1,
        };
        format!("{next_n:06}")
    }

    fn last_index_entry(&self) -> Option<String> {
        let path = self.index_path();
        let mut file = std::fs::File::open(&path).ok()?;
        let len = file.metadata().ok()?.len();
        let start = len.saturating_sub(TAIL_READ_BYTES);
        file.seek(SeekFrom::Start(start)).ok()?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).ok()?;
        buf.lines().filter(|l| !l.trim().is_empty()).last().map(str::to_string)
    }

    /// Persists `record` (whose `backup_id` must already be set to
    /// [`BackupStore::next_id`]'s output) as a sorted-key, 2-space-indented JSON
    /// file, and appends a compact sorted-key index line.
    fn persist(&self, record: &BackupRecord) -> Result<(), BackupError> {
        let record_path = self.record_path(&record.backup_id);
        let value = serde_json::to_value(record).expect("BackupRecord always serializes");
        let sorted = sort_object_keys(value);
        let pretty = serde_json::to_string_pretty(&sorted)?;
        std::fs::write(&record_path, pretty)?;

        let index_entry = IndexEntry {
            backup_id: record.backup_id.clone(),
            kind: record.kind,
            ecu: record.ecu.clone(),
            did: record.did,
        };
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(self.index_path())?;
        writeln!(file, "{}", serde_json::to_string(&index_entry)?)?;
        file.flush()?;
        Ok(())
    }

    /// Creates and persists a `did_write` backup with the next id, before the
    /// write is issued.
    pub fn create_did_write(
        &self,
        ecu: &str,
        did: u16,
        key: Option<&str>,
        old_hex: &str,
        new_hex: &str,
    ) -> Result<BackupRecord, BackupError> {
        let record = BackupRecord {
            backup_id: self.next_id(),
            kind: BackupKind::DidWrite,
            ecu: ecu.to_string(),
            did,
            key: key.map(str::to_string),
            old_hex: Some(old_hex.to_string()),
            new_hex: Some(new_hex.to_string()),
            raw_hex: None,
            notes: None,
        };
        self.persist(&record)?;
        log::info!("backup {} created (did_write, ecu={ecu}, did={did:04X})", record.backup_id);
        Ok(record)
    }

    /// Creates and persists a `did_snapshot` backup with the next id. `key` is
    /// the dataset setting key this snapshot was taken for, if any (a plain
    /// `backup_did` passes `None`; `backup_adaptation` passes `Some`).
    pub fn create_did_snapshot(
        &self,
        ecu: &str,
        did: u16,
        key: Option<&str>,
        raw_hex: &str,
    ) -> Result<BackupRecord, BackupError> {
        let record = BackupRecord {
            backup_id: self.next_id(),
            kind: BackupKind::DidSnapshot,
            ecu: ecu.to_string(),
            did,
            key: key.map(str::to_string),
            old_hex: None,
            new_hex: None,
            raw_hex: Some(raw_hex.to_string()),
            notes: None,
        };
        self.persist(&record)?;
        log::info!("backup {} created (did_snapshot, ecu={ecu}, did={did:04X})", record.backup_id);
        Ok(record)
    }

    /// Loads a backup record by id.
    pub fn load(&self, backup_id: &str) -> Result<BackupRecord, BackupError> {
        let path = self.record_path(backup_id);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackupError::UnknownId(backup_id.to_string())
            } else {
                BackupError::Io(e)
            }
        })?;
        serde_json::from_str(&text).map_err(|e| BackupError::InvalidRecord(backup_id.to_string(), e))
    }

    /// Best-effort side-copy of a record file into a per-run log bundle directory.
    /// Any I/O failure is swallowed and logged at `warn`; it must never fail the
    /// caller's main operation.
    pub fn copy_to_bundle(&self, backup_id: &str, bundle_dir: &Path) {
        let src = self.record_path(backup_id);
        if let Err(e) = std::fs::create_dir_all(bundle_dir) {
            log::warn!("backup bundle copy skipped (could not create {bundle_dir:?}): {e}");
            return;
        }
        let dest = bundle_dir.join(format!("{backup_id}.json"));
        if let Err(e) = std::fs::copy(&src, &dest) {
            log::warn!("backup bundle copy of {backup_id} failed: {e}");
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    backup_id: String,
    kind: BackupKind,
    ecu: String,
    did: u16,
}

fn sort_object_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), sort_object_keys(map[k].clone()));
            }
            serde_json::Value::Object(sorted)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (BackupStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("uds_diag_core_backups_{}_{}", std::process::id(), rand_suffix()));
        (BackupStore::new(&dir).unwrap(), dir)
    }

    fn rand_suffix() -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut h = DefaultHasher::new();
        std::time::SystemTime::now().hash(&mut h);
        h.finish()
    }

    #[test]
    fn first_backup_id_is_000001() {
        let (store, dir) = temp_store();
        let record = store.create_did_write("01", 0xF190, None, "00", "01").unwrap();
        assert_eq!(record.backup_id, "000001");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn backup_ids_strictly_increase() {
        let (store, dir) = temp_store();
        let a = store.create_did_write("01", 0x1234, None, "00", "01").unwrap();
        let b = store.create_did_write("01", 0x1234, None, "01", "02").unwrap();
        let c = store.create_did_snapshot("01", 0xF190, None, "ABCD").unwrap();
        assert_eq!(a.backup_id, "000001");
        assert_eq!(b.backup_id, "000002");
        assert_eq!(c.backup_id, "000003");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_round_trips_a_record() {
        let (store, dir) = temp_store();
        let created = store.create_did_write("01", 0xF190, Some("vin"), "00", "01").unwrap();
        let loaded = store.load(&created.backup_id).unwrap();
        assert_eq!(loaded, created);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_unknown_id_is_an_error() {
        let (store, dir) = temp_store();
        assert!(matches!(store.load("999999"), Err(BackupError::UnknownId(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_index_treated_as_no_backups_yet() {
        let (store, dir) = temp_store();
        assert_eq!(store.next_id(), "000001");
        std::fs::remove_dir_all(&dir).ok();
    }
}
