use std::collections::BTreeMap;
use std::time::Duration;

use shardhome::config::AllocationStrategyConfig;
use shardhome::testing::{RecordingEntity, TestCluster};
use shardhome::types::{RegionAddress, TypeName};
use shardhome::{ClusterSharding, Envelope, ShardedType, ShardingConfig, StateStoreMode};

fn config() -> ShardingConfig {
    ShardingConfig {
        allocation: AllocationStrategyConfig::LeastShard {
            absolute_limit: 2,
            relative_limit: 1.0,
            rebalance_threshold: 1,
        },
        ..TestCluster::fast_config()
    }
}

fn sharded(cluster: &TestCluster, entity: &RecordingEntity) -> ShardedType {
    ShardedType::new(entity.clone())
        .with_config(config())
        .with_state_store(StateStoreMode::KeyValue(cluster.kv.clone()))
}

async fn shards_per_region(
    leader: &ClusterSharding,
    type_name: &TypeName,
) -> BTreeMap<RegionAddress, usize> {
    let mut counts = BTreeMap::new();
    for region in leader.current_allocations(type_name).await.unwrap().into_values() {
        *counts.entry(region).or_default() += 1;
    }
    counts
}

#[tokio::test]
async fn shards_move_to_a_joining_node_without_reordering() {
    let cluster = TestCluster::new();
    let one = cluster.add_node(1);
    let entity = RecordingEntity::new("Cart");
    let region = one.start(sharded(&cluster, &entity)).await.unwrap();
    let type_name = TypeName::new("Cart");

    let ids: Vec<String> = (0..30).map(|i| format!("cart-{i}")).collect();
    for id in &ids {
        region
            .ask(Envelope::new(id.as_str(), "record", vec![1]))
            .await
            .unwrap();
    }
    let before = shards_per_region(&one, &type_name).await;
    assert_eq!(before.len(), 1);
    let total = before[&TestCluster::node_address(1)];
    assert!(total >= 2, "need several shards to rebalance, got {total}");

    let two = cluster.add_node(2);
    two.start(sharded(&cluster, &entity)).await.unwrap();

    // Keep sending while shards move; every entity must see its messages in
    // send order.
    let mut balanced = false;
    for round in 2..40u8 {
        for id in &ids {
            region.tell(Envelope::new(id.as_str(), "record", vec![round])).unwrap();
        }
        let counts = shards_per_region(&one, &type_name).await;
        let on_two = counts
            .get(&TestCluster::node_address(2))
            .copied()
            .unwrap_or(0);
        let on_one = counts
            .get(&TestCluster::node_address(1))
            .copied()
            .unwrap_or(0);
        if on_one + on_two == total && on_one.abs_diff(on_two) <= 1 {
            balanced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(balanced, "shards never balanced");

    // A final ask per entity flushes everything sent before it.
    for id in &ids {
        region
            .ask(Envelope::new(id.as_str(), "record", vec![u8::MAX]))
            .await
            .unwrap();
        let received: Vec<u8> = entity.received(id).into_iter().map(|p| p[0]).collect();
        let mut sorted = received.clone();
        sorted.sort();
        assert_eq!(received, sorted, "out of order for {id}");
        assert_eq!(received.last(), Some(&u8::MAX));
    }

    let moved = ids
        .iter()
        .filter(|id| entity.host(id) == Some(TestCluster::node_address(2)))
        .count();
    assert!(moved > 0);

    one.stop();
    two.stop();
}

#[tokio::test]
async fn a_rebalance_round_moves_at_most_the_limit() {
    let cluster = TestCluster::new();
    let one = cluster.add_node(1);
    let entity = RecordingEntity::new("Cart");
    let mut slow = config();
    slow.rebalance_interval = Duration::from_millis(400);
    let region = one
        .start(
            ShardedType::new(entity.clone())
                .with_config(slow.clone())
                .with_state_store(StateStoreMode::KeyValue(cluster.kv.clone())),
        )
        .await
        .unwrap();
    let type_name = TypeName::new("Cart");
    for i in 0..30 {
        region
            .ask(Envelope::new(format!("cart-{i}"), "record", vec![]))
            .await
            .unwrap();
    }

    let two = cluster.add_node(2);
    two.start(
        ShardedType::new(entity.clone())
            .with_config(slow)
            .with_state_store(StateStoreMode::KeyValue(cluster.kv.clone())),
    )
    .await
    .unwrap();

    // Wait out the first round, then look before the second one fires.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let counts = shards_per_region(&one, &type_name).await;
    let on_two = counts
        .get(&TestCluster::node_address(2))
        .copied()
        .unwrap_or(0);
    assert!((1..=2).contains(&on_two), "moved {on_two} shards in one round");

    one.stop();
    two.stop();
}
