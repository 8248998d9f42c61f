//! Replicated key-value service
//!
//! - `KvStore`: database and per-client dedup records
//! - `KvServer`: proposes client operations and applies committed ones

pub mod config;
pub mod kv;
pub mod server;
pub mod types;

pub use config::KvConfig;
pub use kv::{Applied, DedupRecord, KvStore};
pub use server::{KvServer, KvStatus};
pub use types::{GetArgs, GetReply, KvError, Op, OpKind, OpResult, PutAppendArgs, WriteMode};
