//! In-memory storage implementation
//!
//! No disk I/O. Clones share the same underlying cells, so a test can hand a
//! clone to a fresh `RaftCore` to simulate a crash and restart of one node.

use super::{HardState, Storage, StorageError};
use crate::core::snapshot::Snapshot;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    state: Option<Vec<u8>>,
    snapshot: Option<Vec<u8>>,
}

/// In-memory storage, encoded the same way `FileStorage` encodes its files
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Size in bytes of the stored snapshot
    pub fn snapshot_size(&self) -> usize {
        self.inner.lock().snapshot.as_ref().map_or(0, Vec::len)
    }
}

impl Storage for MemoryStorage {
    fn load_state(&self) -> Result<Option<HardState>, StorageError> {
        match &self.inner.lock().state {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn save_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(state)?;
        self.inner.lock().state = Some(bytes);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        match &self.inner.lock().snapshot {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn save_state_and_snapshot(
        &mut self,
        state: &HardState,
        snapshot: &Snapshot,
    ) -> Result<(), StorageError> {
        let state = serde_json::to_vec(state)?;
        let snapshot = serde_json::to_vec(snapshot)?;
        let mut inner = self.inner.lock();
        inner.state = Some(state);
        inner.snapshot = Some(snapshot);
        Ok(())
    }

    fn state_size(&self) -> usize {
        self.inner.lock().state.as_ref().map_or(0, Vec::len)
    }
}
