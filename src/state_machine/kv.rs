//! Key-value database with per-client deduplication
//!
//! Every committed `Op` is applied here in log order. A client's requests
//! carry strictly increasing sequence numbers; the store remembers the last
//! one applied per client together with its result, so a retried request is
//! answered from the record instead of being executed twice.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::{KvError, Op, OpKind, OpResult};

/// Last request applied for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub last_seq: u64,
    pub result: OpResult,
    /// Term of the log entry that produced `result`
    pub term: u64,
}

/// What applying one operation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// First time this request was seen; the database was updated
    Executed(OpResult),
    /// Same `(client, seq)` as the last record; stored result returned
    Replayed(OpResult),
    /// Older than the last record; nothing changed and nothing to report
    Stale,
}

/// Serialized form of the store handed to the consensus layer
#[derive(Debug, Serialize, Deserialize)]
struct KvSnapshot {
    db: HashMap<String, String>,
    dedup: HashMap<u64, DedupRecord>,
    last_included_index: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStore {
    db: HashMap<String, String>,
    dedup: HashMap<u64, DedupRecord>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.db.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Copy of the whole database
    pub fn data(&self) -> HashMap<String, String> {
        self.db.clone()
    }

    pub fn dedup_record(&self, client_id: u64) -> Option<&DedupRecord> {
        self.dedup.get(&client_id)
    }

    /// Apply a committed operation from an entry of `term`
    pub fn apply(&mut self, op: &Op, term: u64) -> Applied {
        if let Some(record) = self.dedup.get(&op.client_id) {
            if record.last_seq == op.seq {
                return Applied::Replayed(record.result.clone());
            }
            if record.last_seq > op.seq {
                return Applied::Stale;
            }
        }

        let result = self.execute(op);
        self.record_result(op.client_id, op.seq, result.clone(), term);
        Applied::Executed(result)
    }

    fn execute(&mut self, op: &Op) -> OpResult {
        match op.kind {
            OpKind::Get => self.db.get(&op.key).cloned().ok_or(KvError::KeyNotFound),
            OpKind::Put => {
                self.db.insert(op.key.clone(), op.value.clone());
                Ok(String::new())
            }
            OpKind::Append => {
                self.db
                    .entry(op.key.clone())
                    .or_default()
                    .push_str(&op.value);
                Ok(String::new())
            }
        }
    }

    /// Store `result` as the latest record for `client_id`.
    ///
    /// # Panics
    ///
    /// If `seq` does not exceed the stored sequence number. Records only
    /// move forward; anything else means applied history is inconsistent.
    fn record_result(&mut self, client_id: u64, seq: u64, result: OpResult, term: u64) {
        if let Some(previous) = self.dedup.get(&client_id) {
            if seq <= previous.last_seq {
                panic!(
                    "dedup record for client {} would move from seq {} to {}",
                    client_id, previous.last_seq, seq
                );
            }
        }
        self.dedup.insert(
            client_id,
            DedupRecord {
                last_seq: seq,
                result,
                term,
            },
        );
    }

    /// Serialize the database and dedup records as of `last_included_index`
    pub fn snapshot(&self, last_included_index: u64) -> Result<Vec<u8>, serde_json::Error> {
        let snapshot = KvSnapshot {
            db: self.db.clone(),
            dedup: self.dedup.clone(),
            last_included_index,
        };
        serde_json::to_vec(&snapshot)
    }

    /// Rebuild a store from `snapshot` output.
    /// Returns the store and the index it was taken at.
    pub fn restore(data: &[u8]) -> Result<(Self, u64), serde_json::Error> {
        let snapshot: KvSnapshot = serde_json::from_slice(data)?;
        let store = KvStore {
            db: snapshot.db,
            dedup: snapshot.dedup,
        };
        Ok((store, snapshot.last_included_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_append_get() {
        let mut kv = KvStore::new();
        assert_eq!(kv.apply(&Op::put("x", "1", 1, 1), 1), Applied::Executed(Ok(String::new())));
        kv.apply(&Op::append("x", "2", 1, 2), 1);
        assert_eq!(
            kv.apply(&Op::get("x", 1, 3), 1),
            Applied::Executed(Ok("12".to_string()))
        );
    }

    #[test]
    fn test_append_to_missing_key_inserts() {
        let mut kv = KvStore::new();
        kv.apply(&Op::append("k", "abc", 1, 1), 1);
        assert_eq!(kv.get("k"), Some("abc"));
    }

    #[test]
    fn test_put_overwrites() {
        let mut kv = KvStore::new();
        kv.apply(&Op::put("k", "a", 1, 1), 1);
        kv.apply(&Op::put("k", "b", 2, 1), 1);
        assert_eq!(kv.get("k"), Some("b"));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn test_get_missing_key() {
        let mut kv = KvStore::new();
        assert_eq!(
            kv.apply(&Op::get("nope", 1, 1), 1),
            Applied::Executed(Err(KvError::KeyNotFound))
        );
        // The error is the recorded answer
        assert_eq!(
            kv.dedup_record(1).unwrap().result,
            Err(KvError::KeyNotFound)
        );
    }

    #[test]
    fn test_duplicate_seq_is_not_reexecuted() {
        let mut kv = KvStore::new();
        kv.apply(&Op::append("x", "a", 9, 5), 2);
        let again = kv.apply(&Op::append("x", "a", 9, 5), 3);

        assert_eq!(again, Applied::Replayed(Ok(String::new())));
        assert_eq!(kv.get("x"), Some("a"));
        let record = kv.dedup_record(9).unwrap();
        assert_eq!(record.last_seq, 5);
        assert_eq!(record.term, 2);
    }

    #[test]
    fn test_replayed_get_returns_value_at_first_execution() {
        let mut kv = KvStore::new();
        kv.apply(&Op::put("x", "old", 1, 1), 1);
        kv.apply(&Op::get("x", 2, 1), 1);
        kv.apply(&Op::put("x", "new", 1, 2), 1);

        assert_eq!(
            kv.apply(&Op::get("x", 2, 1), 1),
            Applied::Replayed(Ok("old".to_string()))
        );
    }

    #[test]
    fn test_stale_seq_leaves_state_untouched() {
        let mut kv = KvStore::new();
        kv.apply(&Op::put("x", "1", 4, 1), 1);
        kv.apply(&Op::put("x", "2", 4, 2), 1);
        let before = kv.clone();

        assert_eq!(kv.apply(&Op::put("x", "stale", 4, 1), 1), Applied::Stale);
        assert_eq!(kv, before);
    }

    #[test]
    fn test_clients_are_independent() {
        let mut kv = KvStore::new();
        kv.apply(&Op::append("x", "a", 1, 10), 1);
        kv.apply(&Op::append("x", "b", 2, 1), 1);
        assert_eq!(kv.get("x"), Some("ab"));
    }

    #[test]
    #[should_panic(expected = "dedup record for client 3")]
    fn test_record_never_moves_backwards() {
        let mut kv = KvStore::new();
        kv.apply(&Op::put("x", "1", 3, 4), 1);
        kv.record_result(3, 4, Ok(String::new()), 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut kv = KvStore::new();
        kv.apply(&Op::put("a", "1", 1, 1), 1);
        kv.apply(&Op::get("missing", 2, 7), 2);

        let data = kv.snapshot(42).unwrap();
        let (restored, index) = KvStore::restore(&data).unwrap();
        assert_eq!(index, 42);
        assert_eq!(restored, kv);

        // Dedup survives the snapshot
        let mut restored = restored;
        assert_eq!(
            restored.apply(&Op::get("missing", 2, 7), 3),
            Applied::Replayed(Err(KvError::KeyNotFound))
        );
    }

    #[test]
    fn test_restore_rejects_garbage() {
        assert!(KvStore::restore(b"not json").is_err());
    }
}
