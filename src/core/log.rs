//! Replicated log with a compacted prefix
//!
//! The log is 1-indexed. Entries up to `snapshot_index` have been folded into a
//! snapshot and are represented only by `(snapshot_index, snapshot_term)`.
//! With no snapshot that pair is `(0, 0)`, which doubles as the sentinel entry
//! every log starts with.

use serde::{Deserialize, Serialize};

use super::snapshot::SnapshotMetadata;

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when entry was received by leader
    pub term: u64,
    /// Index in the log (1-indexed)
    pub index: u64,
    /// Command/data stored in this entry
    pub command: String,
}

/// In-memory view of the log, offset by the last snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    /// Retained entries; `entries[0].index == snapshot_index + 1`
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the log from persisted entries and the latest snapshot metadata.
    /// Entries already covered by the snapshot are dropped; so is anything after
    /// the first gap in the index sequence.
    pub fn restore(metadata: SnapshotMetadata, entries: Vec<LogEntry>) -> Self {
        let mut log = RaftLog {
            entries: Vec::with_capacity(entries.len()),
            snapshot_index: metadata.last_included_index,
            snapshot_term: metadata.last_included_term,
        };
        for entry in entries {
            if entry.index <= log.snapshot_index {
                continue;
            }
            if entry.index != log.last_index() + 1 {
                break;
            }
            log.entries.push(entry);
        }
        log
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn snapshot_metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            last_included_index: self.snapshot_index,
            last_included_term: self.snapshot_term,
        }
    }

    /// Index of the first retained entry
    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    /// Index of the last entry (the snapshot index if nothing is retained)
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Term of the last entry (the snapshot term if nothing is retained)
    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retained entries in index order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_index {
            return None;
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    /// Get a retained entry by index
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    /// Term of the entry at `index`.
    /// Known for retained entries and for the snapshot boundary itself;
    /// `None` inside the compacted prefix or past the end.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Clone the suffix starting at `index`
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = index.max(self.first_index());
        match self.position(start) {
            Some(pos) => self.entries[pos..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Append a new entry at the end of the log, returning its index
    pub fn append(&mut self, term: u64, command: String) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        index
    }

    /// Remove every entry with index >= `index`
    pub fn truncate_from(&mut self, index: u64) {
        let index = index.max(self.first_index());
        let keep = (index - self.first_index()) as usize;
        self.entries.truncate(keep);
    }

    /// Merge entries received from a leader whose `prev_log_index` matched.
    ///
    /// An existing entry is replaced (together with everything after it) only
    /// when its term differs from the incoming one. Entries that already match
    /// are left alone, so a duplicated or reordered call can never shorten the
    /// log. Returns true if the log changed.
    pub fn merge(&mut self, incoming: &[LogEntry]) -> bool {
        let mut changed = false;
        for entry in incoming {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.entries.push(entry.clone());
                    changed = true;
                }
                None => {
                    if entry.index != self.last_index() + 1 {
                        break;
                    }
                    self.entries.push(entry.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Fold everything through `index` into snapshot metadata.
    ///
    /// If the log holds `index` with the given term the suffix after it is
    /// kept; otherwise the whole log is discarded. No-op when `index` is not
    /// newer than the current snapshot.
    pub fn compact(&mut self, index: u64, term: u64) -> bool {
        if index <= self.snapshot_index {
            return false;
        }
        if self.term_at(index) == Some(term) {
            let drop = (index - self.snapshot_index) as usize;
            self.entries.drain(..drop);
        } else {
            self.entries.clear();
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
        true
    }

    /// Smallest retained index that carries the same term as `index`,
    /// walking backwards over the contiguous run.
    pub fn first_index_of_term_run(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return index;
        };
        let mut i = index;
        while i > self.first_index() {
            match self.term_at(i - 1) {
                Some(t) if t == term => i -= 1,
                _ => break,
            }
        }
        i
    }

    /// Last index at or below `upto` whose entry has `term`
    pub fn last_index_of_term(&self, term: u64, upto: u64) -> Option<u64> {
        let mut i = upto.min(self.last_index());
        while i >= self.snapshot_index {
            let t = self.term_at(i)?;
            if t == term {
                return Some(i);
            }
            if t < term || i == self.snapshot_index {
                return None;
            }
            i -= 1;
        }
        None
    }

    /// Whether a candidate's log is at least as up-to-date as this one:
    /// higher last term wins, equal last terms compare last index.
    pub fn is_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let my_last_term = self.last_term();
        last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= self.last_index())
    }
}
