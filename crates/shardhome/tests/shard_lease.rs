use std::time::Duration;

use shardhome::config::LeaseSettings;
use shardhome::extractor::{HashMessageExtractor, MessageExtractor};
use shardhome::lease::shard_lease_id;
use shardhome::testing::{eventually, RecordingEntity, TestCluster};
use shardhome::types::TypeName;
use shardhome::{Envelope, ShardedType, ShardingConfig, StateStoreMode};

fn config() -> ShardingConfig {
    ShardingConfig {
        lease: Some(LeaseSettings {
            retry_interval: Duration::from_millis(30),
        }),
        ..TestCluster::fast_config()
    }
}

#[tokio::test]
async fn shard_starts_once_its_lease_is_granted() {
    let cluster = TestCluster::new();
    let node = cluster.add_node(1);
    let entity = RecordingEntity::new("Ledger");
    let region = node
        .start(
            ShardedType::new(entity.clone())
                .with_config(config())
                .with_state_store(StateStoreMode::KeyValue(cluster.kv.clone()))
                .with_lease(cluster.lease.clone()),
        )
        .await
        .unwrap();

    cluster.lease.reject_next(3);
    let envelope = Envelope::new("ledger-1", "record", vec![1]);
    let shard_id = HashMessageExtractor::new(10).shard_id(&envelope);
    let lease_id = shard_lease_id(&TypeName::new("Ledger"), &shard_id);

    let reply = region.ask(envelope).await.unwrap();
    assert_eq!(reply, vec![1]);
    assert!(cluster.lease.attempts(&lease_id) >= 4);
    assert_eq!(
        cluster.lease.holder(&lease_id),
        Some(TestCluster::node_address(1).to_string())
    );
    node.stop();
}

#[tokio::test]
async fn lost_lease_restarts_entities_after_reacquiring() {
    let cluster = TestCluster::new();
    let node = cluster.add_node(1);
    let entity = RecordingEntity::new("Ledger");
    let region = node
        .start(
            ShardedType::new(entity.clone())
                .with_config(config())
                .with_state_store(StateStoreMode::KeyValue(cluster.kv.clone()))
                .with_lease(cluster.lease.clone()),
        )
        .await
        .unwrap();

    let envelope = Envelope::new("ledger-1", "record", vec![1]);
    let shard_id = HashMessageExtractor::new(10).shard_id(&envelope);
    let lease_id = shard_lease_id(&TypeName::new("Ledger"), &shard_id);
    region.ask(envelope).await.unwrap();
    assert_eq!(entity.starts("ledger-1"), 1);

    cluster.lease.revoke(&lease_id);
    // The entity is stopped and restarted once the lease is taken again.
    let reply = region
        .ask(Envelope::new("ledger-1", "record", vec![2]))
        .await
        .unwrap();
    assert_eq!(reply, vec![2]);
    eventually(|| cluster.lease.holder(&lease_id).is_some()).await;
    assert_eq!(entity.received("ledger-1"), vec![vec![1], vec![2]]);
    assert_eq!(entity.starts("ledger-1"), 2);
    node.stop();
}
