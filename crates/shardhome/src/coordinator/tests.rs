use std::time::Duration;

use super::*;
use crate::allocation::LeastShardAllocationStrategy;
use crate::remember::KeyValueRememberEntitiesStore;
use crate::storage::memory_kv::MemoryKeyValueStore;
use crate::storage::memory_membership::MemoryMembership;
use crate::transport::LocalTransport;

const TYPE: &str = "Cart";
const WAIT: Duration = Duration::from_secs(2);

fn addr(port: u16) -> RegionAddress {
    RegionAddress::new("127.0.0.1", port)
}

fn config() -> ShardingConfig {
    ShardingConfig {
        retry_interval: Duration::from_secs(5),
        rebalance_interval: Duration::from_secs(3600),
        handoff_timeout: Duration::from_secs(30),
        entity_stop_timeout: Duration::from_secs(1),
        coordinator_write_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

struct Harness {
    transport: Arc<LocalTransport>,
    membership: Arc<MemoryMembership>,
    kv: Arc<MemoryKeyValueStore>,
    deps: CoordinatorDeps,
    inbox: mpsc::UnboundedSender<CoordinatorMessage>,
    queries: mpsc::UnboundedSender<CoordinatorQuery>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), ShardingError>>,
}

impl Harness {
    fn start(config: ShardingConfig) -> Self {
        let transport = Arc::new(LocalTransport::new());
        let membership = Arc::new(MemoryMembership::new());
        let kv = Arc::new(MemoryKeyValueStore::new());
        membership.add_node(addr(1));
        let strategy = Arc::new(LeastShardAllocationStrategy::new(2, 1.0, 1));
        let remember: Option<Arc<dyn RememberEntitiesStore>> = if config.remember_entities {
            Some(Arc::new(KeyValueRememberEntitiesStore::new(
                TypeName::new(TYPE),
                kv.clone(),
            )))
        } else {
            None
        };
        let deps = CoordinatorDeps {
            type_name: TypeName::new(TYPE),
            node: addr(1),
            config: Arc::new(config),
            transport: transport.clone(),
            membership: membership.clone(),
            strategy,
            state_store: StateStoreMode::KeyValue(kv.clone()),
            remember,
            metrics: Arc::new(ShardingMetrics::unregistered()),
        };
        Self::spawn(transport, membership, kv, deps)
    }

    fn spawn(
        transport: Arc<LocalTransport>,
        membership: Arc<MemoryMembership>,
        kv: Arc<MemoryKeyValueStore>,
        deps: CoordinatorDeps,
    ) -> Self {
        let (inbox, mut inbox_rx) = mpsc::unbounded_channel();
        let (queries, mut queries_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let run_deps = deps.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            ShardCoordinator::run(run_deps, &mut inbox_rx, &mut queries_rx, run_cancel).await
        });
        Self {
            transport,
            membership,
            kv,
            deps,
            inbox,
            queries,
            cancel,
            handle,
        }
    }

    /// Stop this coordinator and start a fresh one over the same store.
    async fn restart(self) -> Self {
        self.cancel.cancel();
        let _ = self.handle.await;
        Self::spawn(self.transport, self.membership, self.kv, self.deps)
    }

    /// Join the cluster as `port` and bind a region inbox there.
    fn region(&self, port: u16) -> mpsc::UnboundedReceiver<RegionMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.membership.add_node(addr(port));
        self.transport
            .bind_region(&TypeName::new(TYPE), &addr(port), tx);
        rx
    }

    fn send(&self, message: CoordinatorMessage) {
        self.inbox.send(message).unwrap();
    }

    async fn register(&self, port: u16, rx: &mut mpsc::UnboundedReceiver<RegionMessage>) {
        self.send(CoordinatorMessage::Register { region: addr(port) });
        expect(rx, |m| matches!(m, RegionMessage::RegisterAck { .. })).await;
    }

    async fn allocations(&self) -> BTreeMap<ShardId, RegionAddress> {
        let (tx, rx) = oneshot::channel();
        self.queries.send(CoordinatorQuery::Allocations(tx)).unwrap();
        rx.await.unwrap()
    }
}

/// Next message matching `pred`, skipping others.
async fn expect(
    rx: &mut mpsc::UnboundedReceiver<RegionMessage>,
    pred: impl Fn(&RegionMessage) -> bool,
) -> RegionMessage {
    tokio::time::timeout(WAIT, async {
        loop {
            let msg = rx.recv().await.expect("region inbox closed");
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("timed out waiting for region message")
}

/// Assert no message matching `pred` arrives within `within`.
async fn expect_none(
    rx: &mut mpsc::UnboundedReceiver<RegionMessage>,
    within: Duration,
    pred: impl Fn(&RegionMessage) -> bool,
) {
    let result = tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Some(msg) if pred(&msg) => return msg,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(result.is_err(), "unexpected message: {:?}", result);
}

fn home_of(shard: &str) -> impl Fn(&RegionMessage) -> bool + '_ {
    move |m| matches!(m, RegionMessage::ShardHome { shard_id, .. } if shard_id.as_ref() == shard)
}

async fn allocate(h: &Harness, rx: &mut mpsc::UnboundedReceiver<RegionMessage>, port: u16, shard: &str) -> RegionAddress {
    h.send(CoordinatorMessage::GetShardHome {
        shard_id: ShardId::new(shard),
        region: addr(port),
    });
    match expect(rx, home_of(shard)).await {
        RegionMessage::ShardHome { region, .. } => region,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn get_shard_home_allocates_and_persists() {
    let h = Harness::start(config());
    let mut r1 = h.region(1);
    h.register(1, &mut r1).await;

    h.send(CoordinatorMessage::GetShardHome {
        shard_id: ShardId::new("7"),
        region: addr(1),
    });
    expect(&mut r1, |m| matches!(m, RegionMessage::HostShard { .. })).await;
    assert_eq!(
        expect(&mut r1, home_of("7")).await,
        RegionMessage::ShardHome {
            shard_id: ShardId::new("7"),
            region: addr(1),
        }
    );
    assert_eq!(h.allocations().await.get(&ShardId::new("7")), Some(&addr(1)));
    assert_eq!(h.kv.keys(), vec!["Cart/coordinator".to_string()]);
}

#[tokio::test]
async fn repeated_queries_get_the_same_answer() {
    let h = Harness::start(config());
    let mut r1 = h.region(1);
    let mut r2 = h.region(2);
    h.register(1, &mut r1).await;
    h.register(2, &mut r2).await;

    let first = allocate(&h, &mut r1, 1, "a").await;
    for _ in 0..3 {
        assert_eq!(allocate(&h, &mut r2, 2, "a").await, first);
    }
}

#[tokio::test]
async fn registration_from_non_member_is_ignored() {
    let h = Harness::start(config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.transport
        .bind_region(&TypeName::new(TYPE), &addr(9), tx);
    h.send(CoordinatorMessage::Register { region: addr(9) });
    expect_none(&mut rx, Duration::from_millis(200), |_| true).await;
}

#[tokio::test]
async fn no_answer_without_hosting_regions() {
    let h = Harness::start(config());
    let mut r1 = h.region(1);
    h.send(CoordinatorMessage::GetShardHome {
        shard_id: ShardId::new("1"),
        region: addr(1),
    });
    expect_none(&mut r1, Duration::from_millis(200), home_of("1")).await;
    assert!(h.allocations().await.is_empty());
}

#[tokio::test]
async fn rebalance_waits_for_handoff_before_answering() {
    let h = Harness::start(ShardingConfig {
        rebalance_interval: Duration::from_millis(100),
        ..config()
    });
    let mut r1 = h.region(1);
    h.register(1, &mut r1).await;
    for i in 0..10 {
        allocate(&h, &mut r1, 1, &i.to_string()).await;
    }

    let mut r2 = h.region(2);
    h.register(2, &mut r2).await;

    // Absolute limit 2: exactly two shards leave region 1.
    let mut moving = BTreeSet::new();
    for _ in 0..2 {
        if let RegionMessage::BeginHandOff { shard_id } =
            expect(&mut r1, |m| matches!(m, RegionMessage::BeginHandOff { .. })).await
        {
            moving.insert(shard_id);
        }
    }
    assert_eq!(moving.len(), 2);
    for _ in 0..2 {
        expect(&mut r2, |m| matches!(m, RegionMessage::BeginHandOff { .. })).await;
    }

    let shard = moving.iter().next().unwrap().clone();
    h.send(CoordinatorMessage::GetShardHome {
        shard_id: shard.clone(),
        region: addr(2),
    });
    expect_none(&mut r2, Duration::from_millis(200), home_of(shard.as_ref())).await;

    for port in [1, 2] {
        h.send(CoordinatorMessage::BeginHandOffAck {
            shard_id: shard.clone(),
            region: addr(port),
        });
    }
    expect(&mut r1, |m| matches!(m, RegionMessage::HandOff { shard_id } if *shard_id == shard)).await;
    // Still no answer until the owner confirms the shard is stopped.
    expect_none(&mut r2, Duration::from_millis(100), home_of(shard.as_ref())).await;

    h.send(CoordinatorMessage::ShardStopped {
        shard_id: shard.clone(),
        region: addr(1),
    });
    assert_eq!(
        expect(&mut r2, home_of(shard.as_ref())).await,
        RegionMessage::ShardHome {
            shard_id: shard.clone(),
            region: addr(2),
        }
    );
}

#[tokio::test]
async fn handoff_timeout_keeps_the_old_owner() {
    let h = Harness::start(ShardingConfig {
        rebalance_interval: Duration::from_millis(50),
        retry_interval: Duration::from_millis(50),
        handoff_timeout: Duration::from_millis(200),
        entity_stop_timeout: Duration::from_millis(100),
        ..config()
    });
    let mut r1 = h.region(1);
    h.register(1, &mut r1).await;
    for i in 0..4 {
        allocate(&h, &mut r1, 1, &i.to_string()).await;
    }
    let mut r2 = h.region(2);
    h.register(2, &mut r2).await;

    let RegionMessage::BeginHandOff { shard_id } =
        expect(&mut r1, |m| matches!(m, RegionMessage::BeginHandOff { .. })).await
    else {
        unreachable!()
    };
    h.send(CoordinatorMessage::GetShardHome {
        shard_id: shard_id.clone(),
        region: addr(2),
    });
    // Nobody acks; after the deadline the parked request is answered with
    // the region that still owns the shard.
    assert_eq!(
        expect(&mut r2, home_of(shard_id.as_ref())).await,
        RegionMessage::ShardHome {
            shard_id,
            region: addr(1),
        }
    );
}

#[tokio::test]
async fn node_down_frees_shards_for_reallocation() {
    let h = Harness::start(config());
    let mut r2 = h.region(2);
    h.register(2, &mut r2).await;
    allocate(&h, &mut r2, 2, "7").await;

    let mut r3 = h.region(3);
    h.register(3, &mut r3).await;
    h.membership.remove_node(&addr(2));

    assert_eq!(allocate(&h, &mut r3, 3, "7").await, addr(3));
    let allocations = h.allocations().await;
    assert_eq!(allocations.get(&ShardId::new("7")), Some(&addr(3)));
}

#[tokio::test]
async fn graceful_shutdown_moves_every_shard() {
    let h = Harness::start(config());
    let mut r2 = h.region(2);
    h.register(2, &mut r2).await;
    for s in ["a", "b", "c"] {
        allocate(&h, &mut r2, 2, s).await;
    }
    let mut r3 = h.region(3);
    h.register(3, &mut r3).await;

    h.send(CoordinatorMessage::GracefulShutdownReq { region: addr(2) });
    let mut begun = BTreeSet::new();
    for _ in 0..3 {
        if let RegionMessage::BeginHandOff { shard_id } =
            expect(&mut r3, |m| matches!(m, RegionMessage::BeginHandOff { .. })).await
        {
            begun.insert(shard_id);
        }
    }
    assert_eq!(begun, ["a", "b", "c"].into_iter().map(ShardId::new).collect());

    // A leaving region is never chosen for new shards.
    assert_eq!(allocate(&h, &mut r3, 3, "fresh").await, addr(3));
}

#[tokio::test]
async fn restart_reloads_identical_table() {
    let h = Harness::start(config());
    let mut r1 = h.region(1);
    let mut r2 = h.region(2);
    h.register(1, &mut r1).await;
    h.register(2, &mut r2).await;
    let mut answers = BTreeMap::new();
    for i in 0..6 {
        let shard = i.to_string();
        answers.insert(shard.clone(), allocate(&h, &mut r1, 1, &shard).await);
    }
    let before = h.allocations().await;

    let h = h.restart().await;
    assert_eq!(h.allocations().await, before);
    for (shard, region) in answers {
        assert_eq!(allocate(&h, &mut r2, 2, &shard).await, region);
    }
}

#[tokio::test]
async fn persistent_write_failure_stops_the_coordinator() {
    let h = Harness::start(ShardingConfig {
        coordinator_write_retries: 3,
        ..config()
    });
    let mut r1 = h.region(1);
    h.register(1, &mut r1).await;

    h.kv.fail_next_writes(3);
    h.send(CoordinatorMessage::GetShardHome {
        shard_id: ShardId::new("x"),
        region: addr(1),
    });
    let result = tokio::time::timeout(WAIT, h.handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ShardingError::PersistenceError { .. })));
    expect_none(&mut r1, Duration::from_millis(100), home_of("x")).await;
}

#[tokio::test]
async fn transient_write_failure_is_retried() {
    let h = Harness::start(config());
    let mut r1 = h.region(1);
    h.register(1, &mut r1).await;
    h.kv.fail_next_writes(2);
    assert_eq!(allocate(&h, &mut r1, 1, "x").await, addr(1));
}

#[tokio::test]
async fn remembered_shards_restart_without_traffic() {
    let h = Harness::start(ShardingConfig {
        remember_entities: true,
        ..config()
    });
    let mut r1 = h.region(1);
    h.register(1, &mut r1).await;
    allocate(&h, &mut r1, 1, "5").await;

    // Region 1 leaves; region 2 picks up the remembered shard unasked.
    let mut r2 = h.region(2);
    h.register(2, &mut r2).await;
    h.membership.remove_node(&addr(1));
    expect(&mut r2, |m| matches!(m, RegionMessage::HostShard { shard_id } if shard_id.as_ref() == "5")).await;
}

#[tokio::test]
async fn failed_shard_remember_write_is_retried() {
    let mut h = Harness::start(ShardingConfig {
        remember_entities: true,
        ..config()
    });
    // Remembered shards live in their own store, which fails once.
    let remember_kv = Arc::new(MemoryKeyValueStore::new());
    h.deps.remember = Some(Arc::new(KeyValueRememberEntitiesStore::new(
        TypeName::new(TYPE),
        remember_kv.clone(),
    )));
    let h = h.restart().await;
    let mut r1 = h.region(1);
    h.register(1, &mut r1).await;

    remember_kv.fail_next_writes(1);
    allocate(&h, &mut r1, 1, "5").await;

    let mut r2 = h.region(2);
    h.register(2, &mut r2).await;
    h.membership.remove_node(&addr(1));
    expect(&mut r2, |m| matches!(m, RegionMessage::HostShard { shard_id } if shard_id.as_ref() == "5")).await;
}

#[tokio::test]
async fn exhausted_shard_remember_write_stops_the_coordinator() {
    let h = Harness::start(ShardingConfig {
        remember_entities: true,
        coordinator_write_retries: 2,
        ..config()
    });
    let mut r1 = h.region(1);
    h.register(1, &mut r1).await;

    h.kv.fail_next_writes(2);
    h.send(CoordinatorMessage::GetShardHome {
        shard_id: ShardId::new("5"),
        region: addr(1),
    });
    let result = tokio::time::timeout(WAIT, h.handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ShardingError::PersistenceError { .. })));
    expect_none(&mut r1, Duration::from_millis(100), home_of("5")).await;
}
