//! The shard coordinator: single writer of a type's allocation table.
//!
//! Exactly one coordinator runs per type, on the cluster leader (see
//! [`crate::singleton`]). It loads the table from its store before it reads
//! its inbox, so requests sent during a failover queue up rather than being
//! rejected. Every table change is persisted before it takes effect; a
//! write that keeps failing makes [`ShardCoordinator::run`] return an error
//! and the supervisor restarts it from the store.

mod state;
mod store;

pub use state::{CoordinatorEvent, CoordinatorState};
pub use store::{CoordinatorStore, JournalCoordinatorStore, KeyValueCoordinatorStore, StateStoreMode};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::allocation::{ShardAllocationStrategy, ShardAllocations};
use crate::config::ShardingConfig;
use crate::error::ShardingError;
use crate::membership::{MemberView, Membership, MembershipEvent};
use crate::metrics::ShardingMetrics;
use crate::protocol::{CoordinatorMessage, RegionMessage};
use crate::remember::RememberEntitiesStore;
use crate::transport::{Outbox, Transport};
use crate::types::{RegionAddress, ShardId, TypeName};

/// Read-only questions for a running coordinator.
#[derive(Debug)]
pub(crate) enum CoordinatorQuery {
    Regions(oneshot::Sender<BTreeSet<RegionAddress>>),
    Allocations(oneshot::Sender<BTreeMap<ShardId, RegionAddress>>),
}

/// Everything a coordinator needs, shared across restarts.
#[derive(Clone)]
pub(crate) struct CoordinatorDeps {
    pub type_name: TypeName,
    pub node: RegionAddress,
    pub config: Arc<ShardingConfig>,
    pub transport: Arc<dyn Transport>,
    pub membership: Arc<dyn Membership>,
    pub strategy: Arc<dyn ShardAllocationStrategy>,
    pub state_store: StateStoreMode,
    /// Set when the type remembers entities; used to record allocated shards.
    pub remember: Option<Arc<dyn RememberEntitiesStore>>,
    pub metrics: Arc<ShardingMetrics>,
}

#[derive(Debug)]
enum HandOffPhase {
    /// `BeginHandOff` sent; waiting for these regions and proxies to ack.
    AwaitingAcks(BTreeSet<RegionAddress>),
    /// `HandOff` sent to the owner; waiting for `ShardStopped`.
    Stopping,
}

#[derive(Debug)]
struct Rebalance {
    from: RegionAddress,
    phase: HandOffPhase,
    deadline: Instant,
}

pub(crate) struct ShardCoordinator {
    deps: CoordinatorDeps,
    store: Box<dyn CoordinatorStore>,
    state: CoordinatorState,
    outbox: Outbox,
    members: BTreeSet<RegionAddress>,
    /// Regions that asked to leave; never chosen for new shards.
    graceful: BTreeSet<RegionAddress>,
    rebalances: BTreeMap<ShardId, Rebalance>,
    /// `GetShardHome` requesters parked while their shard is in rebalance.
    deferred: BTreeMap<ShardId, BTreeSet<RegionAddress>>,
    /// `HostShard` sent but `ShardStarted` not yet seen.
    unacked_hosts: BTreeMap<ShardId, RegionAddress>,
    remembered: BTreeSet<ShardId>,
    cancel: CancellationToken,
}

impl ShardCoordinator {
    /// Load state, then serve until cancelled. Returns `Err` when the
    /// coordinator cannot continue safely and must be restarted.
    pub(crate) async fn run(
        deps: CoordinatorDeps,
        inbox: &mut mpsc::UnboundedReceiver<CoordinatorMessage>,
        queries: &mut mpsc::UnboundedReceiver<CoordinatorQuery>,
        cancel: CancellationToken,
    ) -> Result<(), ShardingError> {
        let mut store = deps
            .state_store
            .open(&deps.type_name, deps.config.snapshot_every);
        let state = store.load().await?;

        let mut events = deps.membership.subscribe().await?;
        let mut view = MemberView::default();
        if let Some(first) = events.next().await {
            view.apply(&first);
        }

        let remembered = match (&deps.remember, deps.config.remember_entities) {
            (Some(remember), true) => remember.get_shards().await?,
            _ => BTreeSet::new(),
        };

        let outbox = Outbox::new(Arc::clone(&deps.transport), deps.type_name.clone());
        let mut coordinator = Self {
            deps,
            store,
            state,
            outbox,
            members: view.members,
            graceful: BTreeSet::new(),
            rebalances: BTreeMap::new(),
            deferred: BTreeMap::new(),
            unacked_hosts: BTreeMap::new(),
            remembered,
            cancel,
        };
        coordinator.recover().await?;
        tracing::info!(
            type_name = %coordinator.deps.type_name,
            regions = coordinator.state.regions.len(),
            shards = coordinator.state.shards.len(),
            "shard coordinator started"
        );
        coordinator.serve(inbox, queries, &mut events).await
    }

    /// Drop regions that left while no coordinator was running, then restart
    /// remembered shards.
    async fn recover(&mut self) -> Result<(), ShardingError> {
        let dead_regions: Vec<RegionAddress> = self
            .state
            .regions
            .keys()
            .filter(|r| !self.members.contains(*r))
            .cloned()
            .collect();
        for region in dead_regions {
            self.update(CoordinatorEvent::RegionTerminated { region })
                .await?;
        }
        let dead_proxies: Vec<RegionAddress> = self
            .state
            .proxies
            .iter()
            .filter(|p| !self.members.contains(*p))
            .cloned()
            .collect();
        for proxy in dead_proxies {
            self.update(CoordinatorEvent::RegionProxyTerminated { proxy })
                .await?;
        }
        self.update_metrics();
        self.allocate_remembered().await
    }

    async fn serve(
        &mut self,
        inbox: &mut mpsc::UnboundedReceiver<CoordinatorMessage>,
        queries: &mut mpsc::UnboundedReceiver<CoordinatorQuery>,
        events: &mut crate::membership::MembershipStream,
    ) -> Result<(), ShardingError> {
        let mut rebalance_tick = tokio::time::interval_at(
            Instant::now() + self.deps.config.rebalance_interval,
            self.deps.config.rebalance_interval,
        );
        rebalance_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry_tick = tokio::time::interval_at(
            Instant::now() + self.deps.config.retry_interval,
            self.deps.config.retry_interval,
        );
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Membership first: a request must never be answered with a
            // region whose departure is already queued.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(type_name = %self.deps.type_name, "shard coordinator stopped");
                    return Ok(());
                }
                event = events.next() => match event {
                    Some(event) => self.on_membership(event).await?,
                    None => return Err(ShardingError::CoordinatorUnavailable),
                },
                message = inbox.recv() => match message {
                    Some(message) => self.handle(message).await?,
                    None => return Ok(()),
                },
                Some(query) = queries.recv() => self.answer(query),
                _ = rebalance_tick.tick() => self.rebalance_tick(),
                _ = retry_tick.tick() => self.retry_tick().await?,
            }
        }
    }

    async fn handle(&mut self, message: CoordinatorMessage) -> Result<(), ShardingError> {
        match message {
            CoordinatorMessage::Register { region } => self.register(region).await,
            CoordinatorMessage::RegisterProxy { proxy } => self.register_proxy(proxy).await,
            CoordinatorMessage::GetShardHome { shard_id, region } => {
                self.get_shard_home(shard_id, region).await
            }
            CoordinatorMessage::ShardStarted { shard_id, region } => {
                if self.unacked_hosts.get(&shard_id) == Some(&region) {
                    self.unacked_hosts.remove(&shard_id);
                }
                Ok(())
            }
            CoordinatorMessage::BeginHandOffAck { shard_id, region } => {
                self.handoff_acked(&shard_id, &region);
                Ok(())
            }
            CoordinatorMessage::ShardStopped { shard_id, region } => {
                let stopping = matches!(
                    self.rebalances.get(&shard_id),
                    Some(r) if r.from == region && matches!(r.phase, HandOffPhase::Stopping)
                );
                if stopping {
                    self.complete_rebalance(shard_id, true).await
                } else {
                    tracing::debug!(shard_id = %shard_id, region = %region, "ignoring unexpected ShardStopped");
                    Ok(())
                }
            }
            CoordinatorMessage::GracefulShutdownReq { region } => {
                self.graceful_shutdown(region);
                Ok(())
            }
            CoordinatorMessage::RegionStopped { region } => self.region_terminated(region).await,
        }
    }

    #[instrument(level = "debug", skip(self), fields(type_name = %self.deps.type_name))]
    async fn register(&mut self, region: RegionAddress) -> Result<(), ShardingError> {
        if !self.members.contains(&region) {
            tracing::debug!(region = %region, "ignoring registration from non-member");
            return Ok(());
        }
        if !self.state.regions.contains_key(&region) {
            self.update(CoordinatorEvent::RegionRegistered {
                region: region.clone(),
            })
            .await?;
            tracing::info!(type_name = %self.deps.type_name, region = %region, "region registered");
        }
        self.outbox.to_region(
            &region,
            RegionMessage::RegisterAck {
                coordinator: self.deps.node.clone(),
            },
        );
        self.allocate_remembered().await
    }

    async fn register_proxy(&mut self, proxy: RegionAddress) -> Result<(), ShardingError> {
        if !self.members.contains(&proxy) {
            tracing::debug!(proxy = %proxy, "ignoring proxy registration from non-member");
            return Ok(());
        }
        if !self.state.proxies.contains(&proxy) {
            self.update(CoordinatorEvent::RegionProxyRegistered {
                proxy: proxy.clone(),
            })
            .await?;
            tracing::info!(type_name = %self.deps.type_name, proxy = %proxy, "proxy registered");
        }
        self.outbox.to_region(
            &proxy,
            RegionMessage::RegisterAck {
                coordinator: self.deps.node.clone(),
            },
        );
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(type_name = %self.deps.type_name))]
    async fn get_shard_home(
        &mut self,
        shard_id: ShardId,
        requester: RegionAddress,
    ) -> Result<(), ShardingError> {
        if self.rebalances.contains_key(&shard_id) {
            tracing::debug!(shard_id = %shard_id, "shard in rebalance, deferring GetShardHome");
            self.deferred.entry(shard_id).or_default().insert(requester);
            return Ok(());
        }
        let home = match self.state.shards.get(&shard_id) {
            Some(owner) if self.members.contains(owner) => Some(owner.clone()),
            // The owner left; NodeDown will free the shard and the requester
            // will ask again.
            Some(_) => None,
            None => self.allocate(&shard_id, Some(&requester)).await?,
        };
        if let Some(region) = home {
            self.outbox
                .to_region(&requester, RegionMessage::ShardHome { shard_id, region });
        }
        Ok(())
    }

    /// Allocate a shard with no home. Returns `None` when no region can take it.
    async fn allocate(
        &mut self,
        shard_id: &ShardId,
        requester: Option<&RegionAddress>,
    ) -> Result<Option<RegionAddress>, ShardingError> {
        let allocations = self.candidate_allocations();
        let Some(region) = self
            .deps
            .strategy
            .allocate_shard(requester, shard_id, &allocations)
        else {
            tracing::debug!(shard_id = %shard_id, "no region available for allocation");
            return Ok(None);
        };
        if !allocations.contains_key(&region) {
            tracing::warn!(
                shard_id = %shard_id,
                region = %region,
                "allocation strategy chose an ineligible region"
            );
            return Ok(None);
        }
        // Remembered before allocated: a shard that is remembered but never
        // allocated is picked up again on recovery.
        self.remember_shard(shard_id).await?;
        self.update(CoordinatorEvent::ShardHomeAllocated {
            shard_id: shard_id.clone(),
            region: region.clone(),
        })
        .await?;
        tracing::info!(
            type_name = %self.deps.type_name,
            shard_id = %shard_id,
            region = %region,
            "shard allocated"
        );

        self.unacked_hosts.insert(shard_id.clone(), region.clone());
        self.outbox.to_region(
            &region,
            RegionMessage::HostShard {
                shard_id: shard_id.clone(),
            },
        );
        Ok(Some(region))
    }

    async fn remember_shard(&mut self, shard_id: &ShardId) -> Result<(), ShardingError> {
        let Some(remember) = self.deps.remember.clone() else {
            return Ok(());
        };
        if !self.deps.config.remember_entities || self.remembered.contains(shard_id) {
            return Ok(());
        }
        let mut retry = WriteRetry::new(&self.deps, &self.cancel, "remembered shard");
        while let Err(e) = remember.add_shard(shard_id).await {
            retry.failed(e).await?;
        }
        self.remembered.insert(shard_id.clone());
        Ok(())
    }

    async fn allocate_remembered(&mut self) -> Result<(), ShardingError> {
        let pending: Vec<ShardId> = self
            .remembered
            .iter()
            .filter(|s| !self.state.shards.contains_key(*s) && !self.rebalances.contains_key(*s))
            .cloned()
            .collect();
        for shard_id in pending {
            if self.allocate(&shard_id, None).await?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn candidate_allocations(&self) -> ShardAllocations {
        self.state
            .allocations(|r| self.members.contains(r) && !self.graceful.contains(r))
    }

    fn rebalance_tick(&mut self) {
        let in_progress: BTreeSet<ShardId> = self.rebalances.keys().cloned().collect();
        let mut shards = self
            .deps
            .strategy
            .rebalance(&self.candidate_allocations(), &in_progress);
        for region in &self.graceful {
            if let Some(owned) = self.state.regions.get(region) {
                shards.extend(owned.iter().cloned());
            }
        }
        for shard_id in shards {
            if !self.rebalances.contains_key(&shard_id) {
                self.start_rebalance(shard_id);
            }
        }
    }

    fn start_rebalance(&mut self, shard_id: ShardId) {
        let Some(from) = self.state.shards.get(&shard_id).cloned() else {
            return;
        };
        let targets: BTreeSet<RegionAddress> = self
            .state
            .regions
            .keys()
            .chain(self.state.proxies.iter())
            .filter(|r| self.members.contains(*r))
            .cloned()
            .collect();
        tracing::debug!(
            shard_id = %shard_id,
            from = %from,
            regions = targets.len(),
            "starting shard rebalance"
        );
        for target in &targets {
            self.outbox.to_region(
                target,
                RegionMessage::BeginHandOff {
                    shard_id: shard_id.clone(),
                },
            );
        }
        let phase = if targets.is_empty() {
            self.outbox.to_region(
                &from,
                RegionMessage::HandOff {
                    shard_id: shard_id.clone(),
                },
            );
            HandOffPhase::Stopping
        } else {
            HandOffPhase::AwaitingAcks(targets)
        };
        self.rebalances.insert(
            shard_id,
            Rebalance {
                from,
                phase,
                deadline: Instant::now() + self.deps.config.handoff_timeout,
            },
        );
    }

    fn handoff_acked(&mut self, shard_id: &ShardId, region: &RegionAddress) {
        let Some(rebalance) = self.rebalances.get_mut(shard_id) else {
            return;
        };
        if let HandOffPhase::AwaitingAcks(pending) = &mut rebalance.phase {
            pending.remove(region);
            if pending.is_empty() {
                rebalance.phase = HandOffPhase::Stopping;
                let from = rebalance.from.clone();
                tracing::debug!(shard_id = %shard_id, from = %from, "all regions acked, handing off");
                self.outbox.to_region(
                    &from,
                    RegionMessage::HandOff {
                        shard_id: shard_id.clone(),
                    },
                );
            }
        }
    }

    /// Finish a rebalance. On success the shard loses its home and parked
    /// requests are answered with a new one; otherwise it stays where it was.
    async fn complete_rebalance(&mut self, shard_id: ShardId, ok: bool) -> Result<(), ShardingError> {
        let Some(rebalance) = self.rebalances.remove(&shard_id) else {
            return Ok(());
        };
        if ok {
            if self.state.shards.get(&shard_id) == Some(&rebalance.from) {
                self.update(CoordinatorEvent::ShardHomeDeallocated {
                    shard_id: shard_id.clone(),
                })
                .await?;
            }
            self.unacked_hosts.remove(&shard_id);
            self.deps
                .metrics
                .rebalances
                .with_label_values(&[self.deps.type_name.as_ref()])
                .inc();
            tracing::info!(
                type_name = %self.deps.type_name,
                shard_id = %shard_id,
                from = %rebalance.from,
                "shard handed off"
            );
        } else {
            tracing::warn!(
                type_name = %self.deps.type_name,
                shard_id = %shard_id,
                from = %rebalance.from,
                "shard handoff timed out, shard stays with its current region"
            );
        }
        self.release_deferred(shard_id).await
    }

    /// Re-handle requests parked on a shard, or restart it proactively when
    /// it is remembered and nobody is waiting.
    async fn release_deferred(&mut self, shard_id: ShardId) -> Result<(), ShardingError> {
        match self.deferred.remove(&shard_id) {
            Some(requesters) => {
                for requester in requesters {
                    self.get_shard_home(shard_id.clone(), requester).await?;
                }
            }
            None => {
                if self.remembered.contains(&shard_id) && !self.state.shards.contains_key(&shard_id) {
                    self.allocate(&shard_id, None).await?;
                }
            }
        }
        Ok(())
    }

    fn graceful_shutdown(&mut self, region: RegionAddress) {
        let Some(owned) = self.state.regions.get(&region).cloned() else {
            return;
        };
        if self.graceful.insert(region.clone()) {
            tracing::info!(
                type_name = %self.deps.type_name,
                region = %region,
                shards = owned.len(),
                "region shutting down gracefully"
            );
        }
        for shard_id in owned {
            if !self.rebalances.contains_key(&shard_id) {
                self.start_rebalance(shard_id);
            }
        }
    }

    async fn on_membership(&mut self, event: MembershipEvent) -> Result<(), ShardingError> {
        match event {
            MembershipEvent::CurrentClusterState { members, .. } => {
                let gone: Vec<RegionAddress> = self.members.difference(&members).cloned().collect();
                self.members = members;
                for node in gone {
                    self.node_down(node).await?;
                }
            }
            MembershipEvent::NodeUp(node) => {
                self.members.insert(node);
            }
            MembershipEvent::NodeDown(node) => {
                self.members.remove(&node);
                self.node_down(node).await?;
            }
            MembershipEvent::LeaderChanged(_) => {}
        }
        Ok(())
    }

    async fn node_down(&mut self, node: RegionAddress) -> Result<(), ShardingError> {
        self.outbox.forget(&node);
        self.region_terminated(node).await
    }

    async fn region_terminated(&mut self, region: RegionAddress) -> Result<(), ShardingError> {
        self.graceful.remove(&region);
        self.unacked_hosts.retain(|_, r| r != &region);
        self.forget_pending_acks(&region);

        if self.state.proxies.contains(&region) {
            self.update(CoordinatorEvent::RegionProxyTerminated {
                proxy: region.clone(),
            })
            .await?;
            tracing::info!(type_name = %self.deps.type_name, proxy = %region, "proxy terminated");
        }
        let Some(owned) = self.state.regions.get(&region).cloned() else {
            return Ok(());
        };
        self.update(CoordinatorEvent::RegionTerminated {
            region: region.clone(),
        })
        .await?;
        tracing::info!(
            type_name = %self.deps.type_name,
            region = %region,
            shards = owned.len(),
            "region terminated"
        );

        // Shards of a terminated region are stopped; their handoffs are done.
        self.rebalances.retain(|_, r| r.from != region);
        for shard_id in owned {
            self.release_deferred(shard_id).await?;
        }
        Ok(())
    }

    fn forget_pending_acks(&mut self, region: &RegionAddress) {
        let waiting: Vec<ShardId> = self
            .rebalances
            .iter()
            .filter(|(_, r)| matches!(&r.phase, HandOffPhase::AwaitingAcks(p) if p.contains(region)))
            .map(|(s, _)| s.clone())
            .collect();
        for shard_id in waiting {
            self.handoff_acked(&shard_id, region);
        }
    }

    async fn retry_tick(&mut self) -> Result<(), ShardingError> {
        let now = Instant::now();
        let expired: Vec<ShardId> = self
            .rebalances
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(s, _)| s.clone())
            .collect();
        for shard_id in expired {
            self.complete_rebalance(shard_id, false).await?;
        }

        self.unacked_hosts.retain(|_, r| self.members.contains(r));
        for (shard_id, region) in &self.unacked_hosts {
            self.outbox.to_region(
                region,
                RegionMessage::HostShard {
                    shard_id: shard_id.clone(),
                },
            );
        }
        for (shard_id, rebalance) in &self.rebalances {
            if let HandOffPhase::AwaitingAcks(pending) = &rebalance.phase {
                for region in pending {
                    self.outbox.to_region(
                        region,
                        RegionMessage::BeginHandOff {
                            shard_id: shard_id.clone(),
                        },
                    );
                }
            }
        }
        self.allocate_remembered().await
    }

    fn answer(&self, query: CoordinatorQuery) {
        match query {
            CoordinatorQuery::Regions(reply) => {
                let _ = reply.send(self.state.regions.keys().cloned().collect());
            }
            CoordinatorQuery::Allocations(reply) => {
                let _ = reply.send(self.state.shards.clone());
            }
        }
    }

    /// Persist `event`, then apply it.
    async fn update(&mut self, event: CoordinatorEvent) -> Result<(), ShardingError> {
        let next = self.state.updated(&event)?;
        let mut retry = WriteRetry::new(&self.deps, &self.cancel, "coordinator state");
        while let Err(e) = self.store.persist(&event, &next).await {
            retry.failed(e).await?;
        }
        tracing::debug!(type_name = %self.deps.type_name, event = ?event, "coordinator state updated");
        self.state = next;
        self.update_metrics();
        Ok(())
    }

    fn update_metrics(&self) {
        let label = [self.deps.type_name.as_ref()];
        self.deps
            .metrics
            .allocated_shards
            .with_label_values(&label)
            .set(self.state.shards.len() as i64);
        self.deps
            .metrics
            .regions
            .with_label_values(&label)
            .set(self.state.regions.len() as i64);
    }
}

/// Retry policy shared by every coordinator write.
///
/// Failures back off exponentially from `coordinator_write_backoff` until
/// `coordinator_write_retries` attempts have been made. A version conflict
/// means another coordinator wrote the store and is never retried.
struct WriteRetry<'a> {
    deps: &'a CoordinatorDeps,
    cancel: &'a CancellationToken,
    what: &'static str,
    attempt: u32,
}

impl<'a> WriteRetry<'a> {
    fn new(deps: &'a CoordinatorDeps, cancel: &'a CancellationToken, what: &'static str) -> Self {
        Self {
            deps,
            cancel,
            what,
            attempt: 0,
        }
    }

    /// Record a failed attempt. Returns once the next attempt may start, or
    /// the error when no attempt is left.
    async fn failed(&mut self, error: ShardingError) -> Result<(), ShardingError> {
        self.attempt += 1;
        if let ShardingError::VersionConflict { .. } = error {
            tracing::error!(
                type_name = %self.deps.type_name,
                write = self.what,
                error = %error,
                "store changed underneath this coordinator"
            );
            return Err(error);
        }
        if self.attempt >= self.deps.config.coordinator_write_retries {
            tracing::error!(
                type_name = %self.deps.type_name,
                write = self.what,
                attempts = self.attempt,
                error = %error,
                "coordinator write failed"
            );
            return Err(error);
        }
        let backoff = self
            .deps
            .config
            .coordinator_write_backoff
            .saturating_mul(1u32 << (self.attempt - 1).min(10));
        tracing::warn!(
            type_name = %self.deps.type_name,
            write = self.what,
            attempt = self.attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "coordinator write failed, retrying"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ShardingError::ShuttingDown),
            _ = tokio::time::sleep(backoff) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests;
