//! In-memory test cluster for unit and integration testing.
//!
//! Every node of a [`TestCluster`] shares one in-process transport, one
//! membership service and one set of in-memory stores, so nodes can be added
//! and removed at will to exercise allocation, rebalancing and recovery.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::ShardingConfig;
use crate::entity::{Entity, EntityContext, EntityHandler};
use crate::error::ShardingError;
use crate::metrics::ShardingMetrics;
use crate::sharding::ClusterSharding;
use crate::storage::memory_journal::MemoryEventJournal;
use crate::storage::memory_kv::MemoryKeyValueStore;
use crate::storage::memory_lease::MemoryLeaseProvider;
use crate::storage::memory_membership::MemoryMembership;
use crate::transport::LocalTransport;
use crate::types::{EntityId, RegionAddress, TypeName};

/// Poll `check` every 10ms until it holds, panicking after two seconds.
pub async fn eventually(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct Recorded {
    received: HashMap<EntityId, Vec<Vec<u8>>>,
    starts: HashMap<EntityId, usize>,
    stops: HashMap<EntityId, usize>,
    /// Node each entity was last started on.
    hosts: HashMap<EntityId, RegionAddress>,
}

/// Entity that records what it receives. Clones share their records.
///
/// Tags:
/// - `record`: record the payload and reply with it
/// - `fail`: reply with `EntityFailure`
/// - `passivate`: record, then ask to be passivated
#[derive(Clone)]
pub struct RecordingEntity {
    type_name: TypeName,
    stop_delay: Duration,
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingEntity {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: TypeName::new(type_name),
            stop_delay: Duration::ZERO,
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    /// Make `on_stop` take this long before the stop is counted.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Payloads received by `id`, in order.
    pub fn received(&self, id: &str) -> Vec<Vec<u8>> {
        self.recorded
            .lock()
            .received
            .get(&EntityId::new(id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn received_count(&self) -> usize {
        self.recorded.lock().received.values().map(Vec::len).sum()
    }

    pub fn starts(&self, id: &str) -> usize {
        self.recorded
            .lock()
            .starts
            .get(&EntityId::new(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn stops(&self, id: &str) -> usize {
        self.recorded
            .lock()
            .stops
            .get(&EntityId::new(id))
            .copied()
            .unwrap_or(0)
    }

    /// Node `id` was last started on.
    pub fn host(&self, id: &str) -> Option<RegionAddress> {
        self.recorded.lock().hosts.get(&EntityId::new(id)).cloned()
    }
}

#[async_trait]
impl Entity for RecordingEntity {
    fn type_name(&self) -> TypeName {
        self.type_name.clone()
    }

    async fn spawn(&self, ctx: EntityContext) -> Result<Box<dyn EntityHandler>, ShardingError> {
        let entity_id = ctx.address.entity_id.clone();
        {
            let mut recorded = self.recorded.lock();
            *recorded.starts.entry(entity_id.clone()).or_default() += 1;
            recorded.hosts.insert(entity_id.clone(), ctx.region.clone());
        }
        Ok(Box::new(RecordingHandler {
            entity_id,
            stop_delay: self.stop_delay,
            recorded: Arc::clone(&self.recorded),
            ctx,
        }))
    }
}

struct RecordingHandler {
    entity_id: EntityId,
    stop_delay: Duration,
    recorded: Arc<Mutex<Recorded>>,
    ctx: EntityContext,
}

impl RecordingHandler {
    fn record(&self, payload: &[u8]) {
        self.recorded
            .lock()
            .received
            .entry(self.entity_id.clone())
            .or_default()
            .push(payload.to_vec());
    }
}

#[async_trait]
impl EntityHandler for RecordingHandler {
    async fn handle_request(
        &mut self,
        tag: &str,
        payload: &[u8],
        _headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>, ShardingError> {
        match tag {
            "record" => {
                self.record(payload);
                Ok(payload.to_vec())
            }
            "fail" => Err(ShardingError::EntityFailure {
                entity_id: self.entity_id.clone(),
                reason: "asked to fail".to_string(),
            }),
            "passivate" => {
                self.record(payload);
                self.ctx.passivate();
                Ok(Vec::new())
            }
            other => Err(ShardingError::Unhandled {
                reason: format!("unknown tag: {other}"),
            }),
        }
    }

    async fn on_stop(&mut self) {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        *self
            .recorded
            .lock()
            .stops
            .entry(self.entity_id.clone())
            .or_default() += 1;
    }
}

/// A multi-node in-memory cluster.
///
/// # Example
///
/// ```ignore
/// let cluster = TestCluster::new();
/// let node = cluster.add_node(1);
/// let entity = RecordingEntity::new("Cart");
/// let region = node
///     .start(
///         ShardedType::new(entity.clone())
///             .with_config(TestCluster::fast_config())
///             .with_state_store(StateStoreMode::KeyValue(cluster.kv.clone())),
///     )
///     .await?;
/// region.ask(Envelope::new("cart-1", "record", vec![1])).await?;
/// ```
pub struct TestCluster {
    pub transport: Arc<LocalTransport>,
    pub membership: Arc<MemoryMembership>,
    pub kv: Arc<MemoryKeyValueStore>,
    pub journal: Arc<MemoryEventJournal>,
    pub lease: Arc<MemoryLeaseProvider>,
    nodes: Mutex<BTreeMap<u16, Arc<ClusterSharding>>>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(LocalTransport::new()),
            membership: Arc::new(MemoryMembership::new()),
            kv: Arc::new(MemoryKeyValueStore::new()),
            journal: Arc::new(MemoryEventJournal::new()),
            lease: Arc::new(MemoryLeaseProvider::new()),
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Short intervals so tests run in milliseconds.
    pub fn fast_config() -> ShardingConfig {
        ShardingConfig {
            number_of_shards: 10,
            retry_interval: Duration::from_millis(20),
            handoff_timeout: Duration::from_secs(2),
            entity_stop_timeout: Duration::from_millis(500),
            rebalance_interval: Duration::from_millis(50),
            ask_timeout: Duration::from_secs(2),
            coordinator_write_backoff: Duration::from_millis(5),
            coordinator_failure_backoff_min: Duration::from_millis(20),
            coordinator_failure_backoff_max: Duration::from_millis(200),
            ..Default::default()
        }
    }

    /// Address of node `port`.
    pub fn node_address(port: u16) -> RegionAddress {
        RegionAddress::new("127.0.0.1", port)
    }

    /// Join a node. The first node to join becomes leader.
    pub fn add_node(&self, port: u16) -> Arc<ClusterSharding> {
        let address = Self::node_address(port);
        let node = Arc::new(ClusterSharding::new(
            address.clone(),
            self.transport.clone(),
            self.membership.clone(),
            Arc::new(ShardingMetrics::unregistered()),
        ));
        self.nodes.lock().insert(port, Arc::clone(&node));
        self.membership.add_node(address);
        node
    }

    /// Crash node `port`: stop it without handoff and report it down.
    pub fn remove_node(&self, port: u16) {
        if let Some(node) = self.nodes.lock().remove(&port) {
            node.stop();
        }
        self.membership.remove_node(&Self::node_address(port));
    }

    pub fn node(&self, port: u16) -> Option<Arc<ClusterSharding>> {
        self.nodes.lock().get(&port).cloned()
    }

    /// The node currently running coordinators.
    pub fn leader(&self) -> Option<Arc<ClusterSharding>> {
        let leader = self.membership.leader()?;
        self.nodes.lock().get(&leader.port).cloned()
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
