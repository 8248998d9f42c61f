//! Raft configuration parameters

use std::time::Duration;

/// Configuration for Raft timing parameters
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between replication rounds sent by the leader (default: 100ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 600ms)
    pub election_timeout_max: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max.max(min);
        self
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_timeout_within_range() {
        let config = RaftConfig::default()
            .with_election_timeout(Duration::from_millis(200), Duration::from_millis(250));
        for _ in 0..100 {
            let t = config.random_election_timeout();
            assert!(t >= Duration::from_millis(200) && t <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_inverted_range_is_clamped() {
        let config = RaftConfig::default()
            .with_election_timeout(Duration::from_millis(400), Duration::from_millis(100));
        assert_eq!(config.election_timeout_max, Duration::from_millis(400));
        assert_eq!(config.random_election_timeout(), Duration::from_millis(400));
    }
}
