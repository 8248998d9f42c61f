//! KV service configuration

use std::time::Duration;

/// Configuration for the replicated KV service
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// How long a request waits for its entry to be applied (default: 500ms)
    pub handle_timeout: Duration,
    /// Persisted raft state size in bytes that triggers a snapshot.
    /// `None` disables snapshots.
    pub max_raft_state: Option<usize>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            handle_timeout: Duration::from_millis(500),
            max_raft_state: None,
        }
    }
}

impl KvConfig {
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    pub fn with_max_raft_state(mut self, bytes: usize) -> Self {
        self.max_raft_state = Some(bytes);
        self
    }

    /// Whether the persisted state has grown enough to snapshot
    pub fn should_snapshot(&self, raft_state_size: usize) -> bool {
        self.max_raft_state
            .is_some_and(|limit| raft_state_size >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots_disabled_by_default() {
        assert!(!KvConfig::default().should_snapshot(usize::MAX));
    }

    #[test]
    fn test_snapshot_threshold() {
        let config = KvConfig::default().with_max_raft_state(1000);
        assert!(!config.should_snapshot(999));
        assert!(config.should_snapshot(1000));
    }
}
