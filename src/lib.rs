//! Replicated key-value store on Raft
//!
//! Servers replicate client operations through a Raft log, apply them in
//! order to an in-memory database, and survive crashes through persisted
//! state and snapshots.

pub mod api;
pub mod core;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
