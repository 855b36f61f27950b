use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// Sharding prometheus metrics, labelled by entity type name.
pub struct ShardingMetrics {
    /// Shards in the allocation table (coordinator node only).
    pub allocated_shards: IntGaugeVec,
    /// Hosting regions registered with the coordinator.
    pub regions: IntGaugeVec,
    /// Shards hosted by this node's region.
    pub hosted_shards: IntGaugeVec,
    /// Running entity instances on this node.
    pub entities: IntGaugeVec,
    /// Envelopes buffered by this node's region.
    pub buffered: IntGaugeVec,
    /// Completed shard handoffs.
    pub rebalances: IntCounterVec,
}

const LABELS: &[&str] = &["type_name"];

impl ShardingMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.allocated_shards.clone()))?;
        registry.register(Box::new(metrics.regions.clone()))?;
        registry.register(Box::new(metrics.hosted_shards.clone()))?;
        registry.register(Box::new(metrics.entities.clone()))?;
        registry.register(Box::new(metrics.buffered.clone()))?;
        registry.register(Box::new(metrics.rebalances.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric names")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            allocated_shards: IntGaugeVec::new(
                Opts::new(
                    "sharding_allocated_shards",
                    "Shards in the coordinator allocation table",
                ),
                LABELS,
            )?,
            regions: IntGaugeVec::new(
                Opts::new(
                    "sharding_regions",
                    "Hosting regions registered with the coordinator",
                ),
                LABELS,
            )?,
            hosted_shards: IntGaugeVec::new(
                Opts::new("sharding_hosted_shards", "Shards hosted by this region"),
                LABELS,
            )?,
            entities: IntGaugeVec::new(
                Opts::new("sharding_entities", "Running entity instances"),
                LABELS,
            )?,
            buffered: IntGaugeVec::new(
                Opts::new("sharding_buffered_envelopes", "Envelopes buffered by the region"),
                LABELS,
            )?,
            rebalances: IntCounterVec::new(
                Opts::new("sharding_rebalances_total", "Completed shard handoffs"),
                LABELS,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = ShardingMetrics::unregistered();
        m.entities.with_label_values(&["Cart"]).set(5);
        assert_eq!(m.entities.with_label_values(&["Cart"]).get(), 5);
        assert_eq!(m.entities.with_label_values(&["Other"]).get(), 0);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = ShardingMetrics::new(&r).unwrap();
        m.rebalances.with_label_values(&["Cart"]).inc();
        assert_eq!(m.rebalances.with_label_values(&["Cart"]).get(), 1);
        assert!(!r.gather().is_empty());
    }
}
