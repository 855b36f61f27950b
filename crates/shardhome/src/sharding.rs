//! Per-node entry point: starts regions and the coordinator singleton for
//! each sharded type.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::allocation::{self, ShardAllocationStrategy};
use crate::config::{LeaseSettings, ShardingConfig};
use crate::coordinator::{CoordinatorDeps, StateStoreMode};
use crate::entity::Entity;
use crate::error::ShardingError;
use crate::extractor::{HashMessageExtractor, MessageExtractor};
use crate::lease::LeaseProvider;
use crate::membership::Membership;
use crate::metrics::ShardingMetrics;
use crate::region::{HostingDeps, RegionDeps, RegionHandle, ShardRegion};
use crate::remember::RememberEntitiesMode;
use crate::singleton::{CoordinatorQueries, CoordinatorSingleton};
use crate::transport::Transport;
use crate::types::{RegionAddress, ShardId, TypeName};

/// Everything needed to host one sharded type.
pub struct ShardedType {
    entity: Arc<dyn Entity>,
    config: ShardingConfig,
    extractor: Option<Arc<dyn MessageExtractor>>,
    state_store: Option<StateStoreMode>,
    remember: Option<RememberEntitiesMode>,
    lease: Option<Arc<dyn LeaseProvider>>,
    strategy: Option<Arc<dyn ShardAllocationStrategy>>,
}

impl ShardedType {
    pub fn new(entity: impl Entity) -> Self {
        Self {
            entity: Arc::new(entity),
            config: ShardingConfig::default(),
            extractor: None,
            state_store: None,
            remember: None,
            lease: None,
            strategy: None,
        }
    }

    pub fn with_config(mut self, config: ShardingConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default [`HashMessageExtractor`].
    pub fn with_extractor(mut self, extractor: Arc<dyn MessageExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Where the coordinator keeps the allocation table. Required.
    pub fn with_state_store(mut self, mode: StateStoreMode) -> Self {
        self.state_store = Some(mode);
        self
    }

    /// Remember started entities in `mode` and restart them with their
    /// shard. Turns on `remember_entities`.
    pub fn with_remember_entities(mut self, mode: RememberEntitiesMode) -> Self {
        self.config.remember_entities = true;
        self.remember = Some(mode);
        self
    }

    /// Gate shard activation on a lease from `provider`. Uses default
    /// [`LeaseSettings`] unless the config already carries some.
    pub fn with_lease(mut self, provider: Arc<dyn LeaseProvider>) -> Self {
        if self.config.lease.is_none() {
            self.config.lease = Some(LeaseSettings::default());
        }
        self.lease = Some(provider);
        self
    }

    /// Use a custom strategy instead of the one named by `config.allocation`.
    pub fn with_allocation_strategy(mut self, strategy: Arc<dyn ShardAllocationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// A region that routes for a type without hosting it.
pub struct ProxyType {
    type_name: TypeName,
    config: ShardingConfig,
    extractor: Option<Arc<dyn MessageExtractor>>,
}

impl ProxyType {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: TypeName::new(type_name),
            config: ShardingConfig::default(),
            extractor: None,
        }
    }

    pub fn with_config(mut self, config: ShardingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MessageExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }
}

struct StartedType {
    region: RegionHandle,
    /// `None` for proxies.
    coordinator: Option<CoordinatorSingleton>,
    shutdown_timeout: Duration,
}

/// Sharding on one node.
///
/// Every hosting node runs a [`CoordinatorSingleton`] per type, which is
/// active only while this node is the cluster leader. Proxy-only nodes run no
/// coordinator, so the leader must host every type it coordinates.
pub struct ClusterSharding {
    node: RegionAddress,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    metrics: Arc<ShardingMetrics>,
    types: Mutex<HashMap<TypeName, StartedType>>,
}

impl ClusterSharding {
    pub fn new(
        node: RegionAddress,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        Self {
            node,
            transport,
            membership,
            metrics,
            types: Mutex::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &RegionAddress {
        &self.node
    }

    /// Start hosting a type on this node: its coordinator singleton first,
    /// then its region.
    pub async fn start(&self, sharded: ShardedType) -> Result<RegionHandle, ShardingError> {
        let type_name = sharded.entity.type_name();
        self.ensure_not_started(&type_name)?;
        sharded.config.validate()?;
        let config = Arc::new(sharded.config);

        let state_store = sharded.state_store.ok_or_else(|| ShardingError::InvalidConfig {
            reason: format!("{type_name}: a coordinator state store is required"),
        })?;
        if config.lease.is_some() && sharded.lease.is_none() {
            return Err(ShardingError::InvalidConfig {
                reason: format!("{type_name}: lease settings given without a lease provider"),
            });
        }
        let remember = match (config.remember_entities, &sharded.remember) {
            (true, Some(mode)) => Some(mode.open(&type_name, config.snapshot_every)),
            (true, None) => {
                return Err(ShardingError::InvalidConfig {
                    reason: format!("{type_name}: remember_entities needs a remember store"),
                })
            }
            (false, _) => None,
        };
        let strategy = sharded
            .strategy
            .unwrap_or_else(|| allocation::from_config(&config.allocation));
        let extractor: Arc<dyn MessageExtractor> = match sharded.extractor {
            Some(extractor) => extractor,
            None => Arc::new(HashMessageExtractor::new(config.number_of_shards)),
        };
        let shutdown_timeout = config.handoff_timeout;

        let coordinator = CoordinatorSingleton::start(CoordinatorDeps {
            type_name: type_name.clone(),
            node: self.node.clone(),
            config: Arc::clone(&config),
            transport: Arc::clone(&self.transport),
            membership: Arc::clone(&self.membership),
            strategy,
            state_store,
            remember: remember.clone(),
            metrics: Arc::clone(&self.metrics),
        })
        .await?;

        let region = ShardRegion::spawn(RegionDeps {
            type_name: type_name.clone(),
            node: self.node.clone(),
            config,
            extractor,
            transport: Arc::clone(&self.transport),
            membership: Arc::clone(&self.membership),
            metrics: Arc::clone(&self.metrics),
            hosting: Some(HostingDeps {
                entity: sharded.entity,
                lease: sharded.lease,
                remember,
            }),
        })
        .await;
        let region = match region {
            Ok(region) => region,
            Err(e) => {
                coordinator.stop();
                return Err(e);
            }
        };

        tracing::info!(type_name = %type_name, node = %self.node, "sharded type started");
        self.types.lock().insert(
            type_name,
            StartedType {
                region: region.clone(),
                coordinator: Some(coordinator),
                shutdown_timeout,
            },
        );
        Ok(region)
    }

    /// Start a routing-only region for a type hosted elsewhere.
    pub async fn start_proxy(&self, proxy: ProxyType) -> Result<RegionHandle, ShardingError> {
        self.ensure_not_started(&proxy.type_name)?;
        proxy.config.validate()?;
        let extractor: Arc<dyn MessageExtractor> = match proxy.extractor {
            Some(extractor) => extractor,
            None => Arc::new(HashMessageExtractor::new(proxy.config.number_of_shards)),
        };
        let shutdown_timeout = proxy.config.handoff_timeout;
        let region = ShardRegion::spawn(RegionDeps {
            type_name: proxy.type_name.clone(),
            node: self.node.clone(),
            config: Arc::new(proxy.config),
            extractor,
            transport: Arc::clone(&self.transport),
            membership: Arc::clone(&self.membership),
            metrics: Arc::clone(&self.metrics),
            hosting: None,
        })
        .await?;
        tracing::info!(type_name = %proxy.type_name, node = %self.node, "proxy started");
        self.types.lock().insert(
            proxy.type_name,
            StartedType {
                region: region.clone(),
                coordinator: None,
                shutdown_timeout,
            },
        );
        Ok(region)
    }

    /// The region started for `type_name` on this node.
    pub fn region(&self, type_name: &TypeName) -> Option<RegionHandle> {
        self.types.lock().get(type_name).map(|t| t.region.clone())
    }

    /// Whether this node currently runs the coordinator for `type_name`.
    pub fn runs_coordinator(&self, type_name: &TypeName) -> bool {
        self.types
            .lock()
            .get(type_name)
            .and_then(|t| t.coordinator.as_ref())
            .is_some_and(CoordinatorSingleton::is_active)
    }

    /// Hosting regions known to the coordinator. Only answers on the node
    /// currently running the coordinator.
    pub async fn current_regions(
        &self,
        type_name: &TypeName,
    ) -> Result<BTreeSet<RegionAddress>, ShardingError> {
        let queries = self.coordinator_queries(type_name)?;
        queries.regions().await
    }

    /// The coordinator's allocation table. Only answers on the node currently
    /// running the coordinator.
    pub async fn current_allocations(
        &self,
        type_name: &TypeName,
    ) -> Result<BTreeMap<ShardId, RegionAddress>, ShardingError> {
        let queries = self.coordinator_queries(type_name)?;
        queries.allocations().await
    }

    /// Hand every hosted shard off through the coordinator, then stop all
    /// regions and coordinators of this node. Regions that do not finish
    /// within their handoff timeout are stopped anyway.
    pub async fn shutdown(&self) -> Result<(), ShardingError> {
        let regions: Vec<(RegionHandle, Duration)> = self
            .types
            .lock()
            .values()
            .map(|t| (t.region.clone(), t.shutdown_timeout))
            .collect();
        let results = futures::future::join_all(
            regions
                .iter()
                .map(|(region, limit)| tokio::time::timeout(*limit, region.graceful_shutdown())),
        )
        .await;
        for ((region, _), result) in regions.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(type_name = %region.type_name(), error = %e, "graceful shutdown failed")
                }
                Err(_) => {
                    tracing::warn!(type_name = %region.type_name(), "graceful shutdown timed out")
                }
            }
        }
        self.stop();
        Ok(())
    }

    /// Stop everything on this node immediately, without handing shards off.
    pub fn stop(&self) {
        let types: Vec<(TypeName, StartedType)> = self.types.lock().drain().collect();
        for (type_name, started) in types {
            started.region.stop();
            if let Some(coordinator) = started.coordinator {
                coordinator.stop();
            }
            tracing::info!(type_name = %type_name, node = %self.node, "sharded type stopped");
        }
    }

    fn ensure_not_started(&self, type_name: &TypeName) -> Result<(), ShardingError> {
        if self.types.lock().contains_key(type_name) {
            return Err(ShardingError::InvalidConfig {
                reason: format!("{type_name} is already started on this node"),
            });
        }
        Ok(())
    }

    fn coordinator_queries(&self, type_name: &TypeName) -> Result<CoordinatorQueries, ShardingError> {
        let types = self.types.lock();
        let started = types.get(type_name).ok_or_else(|| ShardingError::Unhandled {
            reason: format!("{type_name} is not started on this node"),
        })?;
        match &started.coordinator {
            Some(coordinator) => Ok(coordinator.queries()),
            None => Err(ShardingError::CoordinatorUnavailable),
        }
    }
}
