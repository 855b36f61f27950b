use crate::error::ShardingError;
use std::time::Duration;

/// Configuration for one sharded entity type.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Shard count used by the default hash extractor. Default: 100.
    pub number_of_shards: u32,
    /// Interval for re-registering with the coordinator, re-asking unresolved
    /// shard homes and re-sending unacknowledged `HostShard`. Default: 2s.
    pub retry_interval: Duration,
    /// Total envelopes a region buffers across all unresolved shards.
    /// Default: 100000.
    pub buffer_size: usize,
    /// Re-asks of `GetShardHome` before buffered envelopes for that shard fail
    /// with `ShardHomeUnavailable`. 0 = retry forever. Default: 0.
    pub shard_home_max_retries: u32,
    /// How long the coordinator waits for a handoff to complete before giving
    /// the shard back to its previous owner. Default: 60s.
    pub handoff_timeout: Duration,
    /// How long a shard waits for its entities to stop during handoff before
    /// force-terminating them. Must be below `handoff_timeout`. Default: 10s.
    pub entity_stop_timeout: Duration,
    /// Period of the coordinator rebalance tick. Default: 10s.
    pub rebalance_interval: Duration,
    /// Timeout for `RegionHandle::ask`. Default: 30s.
    pub ask_timeout: Duration,
    /// Attempts for a single coordinator state write before the coordinator
    /// gives up and restarts. Default: 5.
    pub coordinator_write_retries: u32,
    /// Base backoff between coordinator write attempts, doubled per attempt.
    /// Default: 100ms.
    pub coordinator_write_backoff: Duration,
    /// Minimum restart backoff for a failed coordinator. Default: 1s.
    pub coordinator_failure_backoff_min: Duration,
    /// Maximum restart backoff for a failed coordinator. Default: 30s.
    pub coordinator_failure_backoff_max: Duration,
    /// Durably remember started entities and restart them with their shard.
    /// Default: false.
    pub remember_entities: bool,
    /// Journal-backed stores write a snapshot every this many events.
    /// Default: 100.
    pub snapshot_every: u64,
    /// Passivate entities that received nothing for this long. Ignored when
    /// `remember_entities` is on. Default: None.
    pub passivate_idle_after: Option<Duration>,
    /// Gate shard activation on a per-shard lease. Default: None.
    pub lease: Option<LeaseSettings>,
    /// Allocation and rebalance strategy. Default: least-shard.
    pub allocation: AllocationStrategyConfig,
}

/// Lease settings for shards of one type.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Fixed interval between acquisition attempts. Default: 5s.
    pub retry_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Built-in allocation strategies.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationStrategyConfig {
    /// Allocate to the region with fewest shards; rebalance from the most
    /// loaded regions toward the optimal count.
    LeastShard {
        /// Max shards rebalanced per tick.
        absolute_limit: usize,
        /// Max shards rebalanced per tick as a fraction of all shards,
        /// rounded down. The tighter of the two limits applies, so with few
        /// shards the default of 0.1 allows one move per tick whatever
        /// `absolute_limit` says.
        relative_limit: f64,
        /// Minimum difference between most and least loaded regions before
        /// anything is rebalanced.
        rebalance_threshold: usize,
    },
    /// Place shards on a consistent hash ring of live regions.
    ConsistentHashing {
        virtual_nodes: usize,
        absolute_limit: usize,
    },
}

impl Default for AllocationStrategyConfig {
    fn default() -> Self {
        AllocationStrategyConfig::LeastShard {
            absolute_limit: 20,
            relative_limit: 0.1,
            rebalance_threshold: 1,
        }
    }
}

impl ShardingConfig {
    /// Validate configuration values, naming the offending field on error.
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.number_of_shards == 0 {
            return Err(invalid("number_of_shards must be >= 1"));
        }
        if self.buffer_size == 0 {
            return Err(invalid("buffer_size must be >= 1"));
        }
        if self.snapshot_every == 0 {
            return Err(invalid("snapshot_every must be >= 1"));
        }
        if self.coordinator_write_retries == 0 {
            return Err(invalid("coordinator_write_retries must be >= 1"));
        }
        for (name, value) in [
            ("retry_interval", self.retry_interval),
            ("handoff_timeout", self.handoff_timeout),
            ("entity_stop_timeout", self.entity_stop_timeout),
            ("rebalance_interval", self.rebalance_interval),
            ("ask_timeout", self.ask_timeout),
            ("coordinator_write_backoff", self.coordinator_write_backoff),
            (
                "coordinator_failure_backoff_min",
                self.coordinator_failure_backoff_min,
            ),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be > 0")));
            }
        }
        if self.entity_stop_timeout >= self.handoff_timeout {
            return Err(invalid(format!(
                "entity_stop_timeout ({:?}) must be below handoff_timeout ({:?})",
                self.entity_stop_timeout, self.handoff_timeout
            )));
        }
        if self.coordinator_failure_backoff_max < self.coordinator_failure_backoff_min {
            return Err(invalid(
                "coordinator_failure_backoff_max must be >= coordinator_failure_backoff_min",
            ));
        }
        if let Some(idle) = self.passivate_idle_after {
            if idle.is_zero() {
                return Err(invalid("passivate_idle_after must be > 0"));
            }
        }
        if let Some(lease) = &self.lease {
            if lease.retry_interval.is_zero() {
                return Err(invalid("lease.retry_interval must be > 0"));
            }
        }
        match &self.allocation {
            AllocationStrategyConfig::LeastShard {
                absolute_limit,
                relative_limit,
                rebalance_threshold,
            } => {
                if *absolute_limit == 0 {
                    return Err(invalid("allocation.absolute_limit must be >= 1"));
                }
                if !(*relative_limit > 0.0 && *relative_limit <= 1.0) {
                    return Err(invalid(format!(
                        "allocation.relative_limit must be in (0, 1], got {relative_limit}"
                    )));
                }
                if *rebalance_threshold == 0 {
                    return Err(invalid("allocation.rebalance_threshold must be >= 1"));
                }
            }
            AllocationStrategyConfig::ConsistentHashing {
                virtual_nodes,
                absolute_limit,
            } => {
                if *virtual_nodes == 0 {
                    return Err(invalid("allocation.virtual_nodes must be >= 1"));
                }
                if *absolute_limit == 0 {
                    return Err(invalid("allocation.absolute_limit must be >= 1"));
                }
            }
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ShardingError {
    ShardingError::InvalidConfig {
        reason: reason.into(),
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            number_of_shards: 100,
            retry_interval: Duration::from_secs(2),
            buffer_size: 100_000,
            shard_home_max_retries: 0,
            handoff_timeout: Duration::from_secs(60),
            entity_stop_timeout: Duration::from_secs(10),
            rebalance_interval: Duration::from_secs(10),
            ask_timeout: Duration::from_secs(30),
            coordinator_write_retries: 5,
            coordinator_write_backoff: Duration::from_millis(100),
            coordinator_failure_backoff_min: Duration::from_secs(1),
            coordinator_failure_backoff_max: Duration::from_secs(30),
            remember_entities: false,
            snapshot_every: 100,
            passivate_idle_after: None,
            lease: None,
            allocation: AllocationStrategyConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ShardingConfig::default();
        assert_eq!(config.number_of_shards, 100);
        assert_eq!(config.retry_interval, Duration::from_secs(2));
        assert_eq!(config.buffer_size, 100_000);
        assert_eq!(config.shard_home_max_retries, 0);
        assert!(!config.remember_entities);
        assert!(config.lease.is_none());
        assert_eq!(
            config.allocation,
            AllocationStrategyConfig::LeastShard {
                absolute_limit: 20,
                relative_limit: 0.1,
                rebalance_threshold: 1,
            }
        );
    }

    #[test]
    fn custom_config() {
        let config = ShardingConfig {
            number_of_shards: 10,
            buffer_size: 5,
            ..Default::default()
        };
        assert_eq!(config.number_of_shards, 10);
        assert_eq!(config.buffer_size, 5);
        // Other fields keep defaults
        assert_eq!(config.handoff_timeout, Duration::from_secs(60));
    }

    #[test]
    fn default_config_is_valid() {
        ShardingConfig::default().validate().unwrap();
    }

    #[test]
    fn validate_zero_shards() {
        let config = ShardingConfig {
            number_of_shards: 0,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("number_of_shards"), "got: {msg}");
    }

    #[test]
    fn validate_zero_buffer() {
        let config = ShardingConfig {
            buffer_size: 0,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("buffer_size"), "got: {msg}");
    }

    #[test]
    fn validate_zero_duration() {
        let config = ShardingConfig {
            retry_interval: Duration::ZERO,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("retry_interval"), "got: {msg}");
    }

    #[test]
    fn validate_entity_stop_timeout_below_handoff() {
        let config = ShardingConfig {
            entity_stop_timeout: Duration::from_secs(60),
            handoff_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("entity_stop_timeout"), "got: {msg}");
    }

    #[test]
    fn validate_relative_limit_range() {
        let config = ShardingConfig {
            allocation: AllocationStrategyConfig::LeastShard {
                absolute_limit: 2,
                relative_limit: 1.5,
                rebalance_threshold: 1,
            },
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("relative_limit"), "got: {msg}");
    }

    #[test]
    fn validate_lease_retry_interval() {
        let config = ShardingConfig {
            lease: Some(LeaseSettings {
                retry_interval: Duration::ZERO,
            }),
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("lease.retry_interval"), "got: {msg}");
    }
}
