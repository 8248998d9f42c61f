//! File-based storage implementation for Raft persistent state
//!
//! Stores two files within a directory:
//! - `state` - term, vote and log as one JSON record
//! - `snapshot` - most recent snapshot as JSON
//!
//! Each file is a single line `"{json} {crc32_hex}\n"`, replaced atomically
//! (write temp, fsync, rename) so a crash leaves either the old or the new
//! contents. The checksum catches anything else.

use super::{HardState, Storage, StorageError};
use crate::core::snapshot::Snapshot;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state";
const SNAPSHOT_FILE: &str = "snapshot";

/// File-based storage implementation
pub struct FileStorage {
    dir: PathBuf,
    /// Length of the JSON payload last written to `state`
    state_size: usize,
}

impl FileStorage {
    /// Open (or create) storage in the given directory
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut storage = FileStorage { dir, state_size: 0 };
        storage.state_size = storage
            .read_with_checksum(&storage.path(STATE_FILE))?
            .map_or(0, |data| data.len());
        Ok(storage)
    }

    /// Directory holding the files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Encode `value` and atomically replace `path` with `"{json} {crc}\n"`.
    /// Returns the payload length.
    fn write_record<T: Serialize>(&self, path: &Path, value: &T) -> Result<usize, StorageError> {
        let json = serde_json::to_string(value)?;
        let checksum = crc32fast::hash(json.as_bytes());
        let content = format!("{} {:08x}\n", json, checksum);
        self.atomic_write(path, content.as_bytes())?;
        Ok(json.len())
    }

    fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        match self.read_with_checksum(path)? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Read and verify checksum, returns the data portion
    fn read_with_checksum(&self, path: &Path) -> Result<Option<String>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)?;
        let content = content.trim_end_matches('\n');
        if content.is_empty() {
            return Ok(None);
        }

        let (data, checksum_str) = content.rsplit_once(' ').ok_or_else(|| {
            StorageError::Corruption(format!("invalid format in {:?}: missing checksum", path))
        })?;

        let stored = u32::from_str_radix(checksum_str, 16).map_err(|_| {
            StorageError::Corruption(format!("invalid checksum format in {:?}", path))
        })?;
        let computed = crc32fast::hash(data.as_bytes());
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch in {:?}: stored {:08x}, computed {:08x}",
                path, stored, computed
            )));
        }

        Ok(Some(data.to_string()))
    }

    /// Atomically write data to a file (write to temp, fsync, rename)
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;

        // Make the rename itself durable
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load_state(&self) -> Result<Option<HardState>, StorageError> {
        self.read_record(&self.path(STATE_FILE))
    }

    fn save_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.state_size = self.write_record(&self.path(STATE_FILE), state)?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.read_record(&self.path(SNAPSHOT_FILE))
    }

    fn save_state_and_snapshot(
        &mut self,
        state: &HardState,
        snapshot: &Snapshot,
    ) -> Result<(), StorageError> {
        self.write_record(&self.path(SNAPSHOT_FILE), snapshot)?;
        self.save_state(state)
    }

    fn state_size(&self) -> usize {
        self.state_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log::LogEntry;
    use crate::core::snapshot::SnapshotMetadata;
    use tempfile::TempDir;

    fn test_storage() -> (FileStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        (storage, dir)
    }

    fn state_with_entries(term: u64, count: u64) -> HardState {
        HardState {
            current_term: term,
            voted_for: Some(1),
            log: (1..=count)
                .map(|index| LogEntry {
                    term,
                    index,
                    command: format!("CMD {}", index),
                })
                .collect(),
        }
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: 10,
                last_included_term: 2,
            },
            data: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn test_fresh_directory_has_no_state() {
        let (storage, _dir) = test_storage();
        assert!(storage.load_state().unwrap().is_none());
        assert!(storage.load_snapshot().unwrap().is_none());
        assert_eq!(storage.state_size(), 0);
    }

    #[test]
    fn test_save_and_load_state() {
        let (mut storage, _dir) = test_storage();
        let state = state_with_entries(4, 3);
        storage.save_state(&state).unwrap();
        assert_eq!(storage.load_state().unwrap(), Some(state));
        assert!(storage.state_size() > 0);
    }

    #[test]
    fn test_state_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let state = state_with_entries(42, 5);
        let size = {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .save_state_and_snapshot(&state, &sample_snapshot())
                .unwrap();
            storage.state_size()
        };

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_state().unwrap(), Some(state));
        assert_eq!(storage.load_snapshot().unwrap(), Some(sample_snapshot()));
        assert_eq!(storage.state_size(), size);
    }

    #[test]
    fn test_overwrite_leaves_no_temp_file() {
        let (mut storage, dir) = test_storage();
        storage.save_state(&state_with_entries(1, 1)).unwrap();
        storage.save_state(&state_with_entries(2, 2)).unwrap();
        assert!(!dir.path().join("state.tmp").exists());
        assert_eq!(storage.load_state().unwrap().unwrap().current_term, 2);
    }

    #[test]
    fn test_detects_corrupted_state() {
        let (mut storage, dir) = test_storage();
        storage.save_state(&state_with_entries(1, 1)).unwrap();

        let path = dir.path().join("state");
        fs::write(
            &path,
            "{\"current_term\":9,\"voted_for\":null,\"log\":[]} 12345678\n",
        )
        .unwrap();

        assert!(matches!(
            storage.load_state(),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_detects_missing_checksum() {
        let (storage, dir) = test_storage();
        fs::write(dir.path().join("snapshot"), "garbage\n").unwrap();
        assert!(matches!(
            storage.load_snapshot(),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_checksum_matches_ieee_crc32() {
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF43926);
    }
}
