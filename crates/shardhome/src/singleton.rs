//! Runs a type's coordinator on the cluster leader.
//!
//! Every node starts a [`CoordinatorSingleton`] per type. It follows the
//! leadership events of the membership stream: when this node becomes
//! leader it binds the coordinator inbox and starts a supervised
//! coordinator; when leadership moves away it stops the coordinator at once
//! and unbinds. The new leader reloads the table from the store before
//! answering, so a short overlap is harmless.
//!
//! Within a leadership term the inbox outlives coordinator restarts, so
//! requests sent while a failed coordinator backs off are served by the next
//! instance instead of being lost.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::ShardingConfig;
use crate::coordinator::{CoordinatorDeps, CoordinatorQuery, ShardCoordinator};
use crate::error::ShardingError;
use crate::membership::{MemberView, MembershipStream};
use crate::protocol::CoordinatorMessage;
use crate::types::{RegionAddress, ShardId};

type QuerySlot = Arc<Mutex<Option<mpsc::UnboundedSender<CoordinatorQuery>>>>;

/// Delay before restart number `failures` (1-based) of a crashed
/// coordinator: `min * 2^min(failures - 1, 10)`, capped at `max`.
pub(crate) fn restart_backoff(config: &ShardingConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(10);
    config
        .coordinator_failure_backoff_min
        .saturating_mul(1u32 << exponent)
        .min(config.coordinator_failure_backoff_max)
}

pub(crate) struct CoordinatorSingleton {
    queries: CoordinatorQueries,
    cancel: CancellationToken,
}

impl CoordinatorSingleton {
    pub(crate) async fn start(deps: CoordinatorDeps) -> Result<Self, ShardingError> {
        let events = deps.membership.subscribe().await?;
        let slot: QuerySlot = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();
        tokio::spawn(follow_leader(
            deps,
            events,
            Arc::clone(&slot),
            cancel.clone(),
        ));
        Ok(Self {
            queries: CoordinatorQueries { slot },
            cancel,
        })
    }

    /// Whether this node currently runs the coordinator.
    pub(crate) fn is_active(&self) -> bool {
        self.queries.slot.lock().is_some()
    }

    pub(crate) fn queries(&self) -> CoordinatorQueries {
        self.queries.clone()
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Read access to whichever coordinator this node is running.
#[derive(Clone)]
pub(crate) struct CoordinatorQueries {
    slot: QuerySlot,
}

impl CoordinatorQueries {
    pub(crate) async fn regions(&self) -> Result<BTreeSet<RegionAddress>, ShardingError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorQuery::Regions(tx))?;
        rx.await.map_err(|_| ShardingError::CoordinatorUnavailable)
    }

    pub(crate) async fn allocations(
        &self,
    ) -> Result<BTreeMap<ShardId, RegionAddress>, ShardingError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorQuery::Allocations(tx))?;
        rx.await.map_err(|_| ShardingError::CoordinatorUnavailable)
    }

    fn send(&self, query: CoordinatorQuery) -> Result<(), ShardingError> {
        let slot = self.slot.lock();
        let sender = slot.as_ref().ok_or(ShardingError::CoordinatorUnavailable)?;
        sender
            .send(query)
            .map_err(|_| ShardingError::CoordinatorUnavailable)
    }
}

async fn follow_leader(
    deps: CoordinatorDeps,
    mut events: MembershipStream,
    queries: QuerySlot,
    cancel: CancellationToken,
) {
    let mut view = MemberView::default();
    let mut term: Option<CancellationToken> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => view.apply(&event),
                None => break,
            },
        }
        let leading = view.leader.as_ref() == Some(&deps.node);
        match (leading, term.is_some()) {
            (true, false) => term = Some(start_term(&deps, &queries, &cancel)),
            (false, true) => {
                if let Some(term) = term.take() {
                    stop_term(&deps, &queries, term);
                }
            }
            _ => {}
        }
    }
    if let Some(term) = term.take() {
        stop_term(&deps, &queries, term);
    }
}

fn start_term(
    deps: &CoordinatorDeps,
    queries: &QuerySlot,
    cancel: &CancellationToken,
) -> CancellationToken {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (queries_tx, queries_rx) = mpsc::unbounded_channel();
    deps.transport
        .bind_coordinator(&deps.type_name, &deps.node, inbox_tx);
    *queries.lock() = Some(queries_tx);
    let term = cancel.child_token();
    tracing::info!(type_name = %deps.type_name, node = %deps.node, "became coordinator");
    tokio::spawn(supervise(deps.clone(), inbox_rx, queries_rx, term.clone()));
    term
}

fn stop_term(deps: &CoordinatorDeps, queries: &QuerySlot, term: CancellationToken) {
    term.cancel();
    deps.transport
        .unbind_coordinator(&deps.type_name, &deps.node);
    *queries.lock() = None;
    tracing::info!(type_name = %deps.type_name, node = %deps.node, "no longer coordinator");
}

/// Run the coordinator until the term ends, restarting it with backoff
/// whenever it fails.
async fn supervise(
    deps: CoordinatorDeps,
    mut inbox: mpsc::UnboundedReceiver<CoordinatorMessage>,
    mut queries: mpsc::UnboundedReceiver<CoordinatorQuery>,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        let started = Instant::now();
        let result =
            ShardCoordinator::run(deps.clone(), &mut inbox, &mut queries, cancel.clone()).await;
        if cancel.is_cancelled() {
            return;
        }
        let e = match result {
            Ok(()) => return,
            Err(e) => e,
        };
        // A coordinator that ran for a while starts the count over.
        if started.elapsed() >= deps.config.coordinator_failure_backoff_max {
            failures = 0;
        }
        failures += 1;
        let backoff = restart_backoff(&deps.config, failures);
        tracing::error!(
            type_name = %deps.type_name,
            error = %e,
            failures,
            backoff_ms = backoff.as_millis() as u64,
            "shard coordinator failed, restarting"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::LeastShardAllocationStrategy;
    use crate::coordinator::StateStoreMode;
    use crate::metrics::ShardingMetrics;
    use crate::protocol::RegionMessage;
    use crate::storage::memory_kv::MemoryKeyValueStore;
    use crate::storage::memory_membership::MemoryMembership;
    use crate::testing::eventually;
    use crate::transport::{LocalTransport, Transport};
    use crate::types::TypeName;

    fn addr(port: u16) -> RegionAddress {
        RegionAddress::new("127.0.0.1", port)
    }

    fn deps(
        node: u16,
        config: ShardingConfig,
        transport: &Arc<LocalTransport>,
        membership: &Arc<MemoryMembership>,
        kv: &Arc<MemoryKeyValueStore>,
    ) -> CoordinatorDeps {
        CoordinatorDeps {
            type_name: TypeName::new("Cart"),
            node: addr(node),
            config: Arc::new(config),
            transport: transport.clone(),
            membership: membership.clone(),
            strategy: Arc::new(LeastShardAllocationStrategy::new(1, 0.1, 1)),
            state_store: StateStoreMode::KeyValue(kv.clone()),
            remember: None,
            metrics: Arc::new(ShardingMetrics::unregistered()),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ShardingConfig {
            coordinator_failure_backoff_min: Duration::from_millis(100),
            coordinator_failure_backoff_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(restart_backoff(&config, 1), Duration::from_millis(100));
        assert_eq!(restart_backoff(&config, 2), Duration::from_millis(200));
        assert_eq!(restart_backoff(&config, 4), Duration::from_millis(800));
        assert_eq!(restart_backoff(&config, 5), Duration::from_secs(1));
        assert_eq!(restart_backoff(&config, 50), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn coordinator_follows_leadership() {
        let transport = Arc::new(LocalTransport::new());
        let membership = Arc::new(MemoryMembership::new());
        let kv = Arc::new(MemoryKeyValueStore::new());
        membership.add_node(addr(1));
        membership.add_node(addr(2));
        let type_name = TypeName::new("Cart");

        let one = CoordinatorSingleton::start(deps(
            1,
            ShardingConfig::default(),
            &transport,
            &membership,
            &kv,
        ))
        .await
        .unwrap();
        let two = CoordinatorSingleton::start(deps(
            2,
            ShardingConfig::default(),
            &transport,
            &membership,
            &kv,
        ))
        .await
        .unwrap();
        eventually(|| transport.is_coordinator_bound(&type_name, &addr(1))).await;
        assert!(one.is_active());
        assert!(!two.is_active());
        assert!(matches!(
            two.queries().regions().await,
            Err(ShardingError::CoordinatorUnavailable)
        ));

        membership.set_leader(Some(addr(2)));
        eventually(|| transport.is_coordinator_bound(&type_name, &addr(2))).await;
        eventually(|| !one.is_active()).await;
        assert!(!transport.is_coordinator_bound(&type_name, &addr(1)));
        assert!(two.queries().regions().await.unwrap().is_empty());

        one.stop();
        two.stop();
    }

    #[tokio::test]
    async fn failed_coordinator_is_restarted_without_losing_requests() {
        let transport = Arc::new(LocalTransport::new());
        let membership = Arc::new(MemoryMembership::new());
        let kv = Arc::new(MemoryKeyValueStore::new());
        membership.add_node(addr(1));
        let type_name = TypeName::new("Cart");
        let (region_tx, mut region_rx) = mpsc::unbounded_channel();
        transport.bind_region(&type_name, &addr(1), region_tx);

        let config = ShardingConfig {
            coordinator_write_retries: 1,
            coordinator_failure_backoff_min: Duration::from_millis(20),
            coordinator_failure_backoff_max: Duration::from_millis(100),
            ..Default::default()
        };
        let singleton = CoordinatorSingleton::start(deps(1, config, &transport, &membership, &kv))
            .await
            .unwrap();
        eventually(|| transport.is_coordinator_bound(&type_name, &addr(1))).await;

        kv.fail_next_writes(1);
        for _ in 0..2 {
            transport
                .send_to_coordinator(
                    &type_name,
                    &addr(1),
                    CoordinatorMessage::Register { region: addr(1) },
                )
                .await
                .unwrap();
        }
        // The first registration kills the coordinator; the second waits in
        // the inbox and is served by the restarted one.
        let ack = tokio::time::timeout(Duration::from_secs(2), region_rx.recv())
            .await
            .unwrap();
        assert_eq!(
            ack,
            Some(RegionMessage::RegisterAck {
                coordinator: addr(1)
            })
        );
        assert_eq!(
            singleton.queries().regions().await.unwrap(),
            BTreeSet::from([addr(1)])
        );
        singleton.stop();
    }
}
