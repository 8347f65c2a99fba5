use std::time::Duration;

/// Presence (membership tracker) timing
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// Interval between heartbeats republishing the local state.
    pub heartbeat_interval: Duration,
    /// Interval between eviction passes.
    pub housekeeping_interval: Duration,
    /// A participant silent for `timeout_factor × heartbeat_interval` is evicted.
    pub timeout_factor: f64,
}

impl PresenceConfig {
    /// Silence after which a participant is considered gone.
    #[must_use]
    pub fn participant_timeout(&self) -> Duration {
        self.heartbeat_interval.mul_f64(self.timeout_factor)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            housekeeping_interval: Duration::from_secs(1),
            timeout_factor: 3.5,
        }
    }
}

/// Leader election timing and policy
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// Delay before the first evaluation, letting presence fill up.
    pub warmup: Duration,
    /// Debounce delay of every later evaluation.
    pub react_delay: Duration,
    /// Debounce delay of leadership change notifications.
    pub notify_debounce: Duration,
    /// Re-run the comparator even while some participant claims leadership.
    pub allow_leader_demotion: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(10),
            react_delay: Duration::from_secs(1),
            notify_debounce: Duration::from_millis(100),
            allow_leader_demotion: false,
        }
    }
}

/// Indexed queue tracker window
#[derive(Clone, Debug)]
pub struct IndexedQueueConfig {
    /// Maximum number of items kept in memory.
    pub max_window: usize,
}

impl Default for IndexedQueueConfig {
    fn default() -> Self {
        Self { max_window: 1000 }
    }
}

/// Replication coordinator timing
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// Delay before a follower retries after a failed backfill or callback.
    pub retry_delay: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Distributed state timing
#[derive(Clone, Debug)]
pub struct DistributedStateConfig {
    /// Delay before adopting the most recent participant state.
    pub warmup: Duration,
}

impl Default for DistributedStateConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_participant_timeout() {
        let config = PresenceConfig::default();

        assert_eq!(config.participant_timeout(), Duration::from_millis(52_500));
    }
}
