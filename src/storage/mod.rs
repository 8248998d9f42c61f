//! Storage abstraction for Raft persistent state
//!
//! Raft requires `current_term`, `voted_for` and the log to be persisted to
//! stable storage before responding to RPCs. The three are written together
//! as one [`HardState`] record, so a crash never observes a torn update.
//! Snapshots are stored beside that record.
//!
//! Implementations:
//! - `MemoryStorage`: in-memory, shareable between incarnations of a node
//! - `FileStorage`: file-based storage with CRC32 checksums

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::core::log::LogEntry;
use crate::core::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Persisted record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The durable part of the consensus state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    /// Entries after the latest snapshot
    pub log: Vec<LogEntry>,
}

/// Storage trait for Raft persistent state
///
/// Implementations must ensure durability: once a save returns, the data
/// survives a crash. Operations are synchronous to keep `RaftCore` simple.
pub trait Storage: Send {
    /// Load the last saved state. `None` on a fresh start.
    fn load_state(&self) -> Result<Option<HardState>, StorageError>;

    /// Replace the saved state
    fn save_state(&mut self, state: &HardState) -> Result<(), StorageError>;

    /// Load the most recent snapshot. `None` if none was ever saved.
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Save a snapshot together with the state that was compacted by it.
    ///
    /// The snapshot is made durable before the state, so after a crash the
    /// snapshot is never older than the entries dropped from the log.
    fn save_state_and_snapshot(
        &mut self,
        state: &HardState,
        snapshot: &Snapshot,
    ) -> Result<(), StorageError>;

    /// Size in bytes of the encoded state record
    fn state_size(&self) -> usize;
}
