//! One shard's process: the single owner of its entities on this node.
//!
//! A shard activates in up to three steps. It takes its lease (when one is
//! configured), loads the remembered entity ids (when remembering is on), and
//! only then delivers messages. Everything arriving earlier is buffered in
//! receipt order. Handoff stops every entity, bounded by the entity stop
//! timeout, releases the lease and returns still-buffered messages to the
//! region so they follow the shard to its next home.

mod entity_instance;


pub(crate) use entity_instance::Delivery;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::MessageBuffer;
use crate::config::ShardingConfig;
use crate::entity::{Entity, EntityContext};
use crate::envelope::{Originator, ShardEnvelope};
use crate::error::ShardingError;
use crate::lease::{LeaseGuard, LeaseLostCallback, LeaseProvider};
use crate::metrics::ShardingMetrics;
use crate::region::RegionCommand;
use crate::remember::RememberEntitiesStore;
use crate::types::{EntityAddress, EntityId, RegionAddress, ShardId, TypeName};
use entity_instance::EntityInstance;

#[derive(Debug)]
pub(crate) enum ShardCommand {
    Deliver {
        envelope: ShardEnvelope,
        originator: Originator,
    },
    HandOff,
    GetState(oneshot::Sender<BTreeSet<EntityId>>),
    Passivate(EntityId),
    EntityStopped {
        entity_id: EntityId,
        generation: u64,
    },
    LeaseAcquired {
        epoch: u64,
    },
    LeaseLost {
        epoch: u64,
        reason: Option<String>,
    },
    EntitiesLoaded(Result<BTreeSet<EntityId>, ShardingError>),
    RememberWritten(Result<(), ShardingError>),
    RetryLoad,
    RetryRemember,
    RestartEntity(EntityId),
}

/// What every shard of a region shares.
#[derive(Clone)]
pub(crate) struct ShardDeps {
    pub type_name: TypeName,
    pub region: RegionAddress,
    pub entity: Arc<dyn Entity>,
    pub config: Arc<ShardingConfig>,
    pub lease: Option<Arc<dyn LeaseProvider>>,
    pub remember: Option<Arc<dyn RememberEntitiesStore>>,
    pub metrics: Arc<ShardingMetrics>,
    pub region_tx: mpsc::UnboundedSender<RegionCommand>,
}

/// The region's side of a running shard.
pub(crate) struct ShardHandle {
    tx: mpsc::UnboundedSender<ShardCommand>,
}

impl ShardHandle {
    /// Start a shard process. It reports back with
    /// [`RegionCommand::ShardTerminated`] once handed off.
    pub(crate) fn spawn(deps: ShardDeps, shard_id: ShardId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shard = Shard::new(deps, shard_id, tx.clone());
        tokio::spawn(shard.run(rx));
        Self { tx }
    }

    pub(crate) fn deliver(
        &self,
        envelope: ShardEnvelope,
        originator: Originator,
    ) -> Result<(), (ShardEnvelope, Originator)> {
        match self.tx.send(ShardCommand::Deliver {
            envelope,
            originator,
        }) {
            Ok(()) => Ok(()),
            Err(e) => match e.0 {
                ShardCommand::Deliver {
                    envelope,
                    originator,
                } => Err((envelope, originator)),
                _ => Ok(()),
            },
        }
    }

    pub(crate) fn hand_off(&self) {
        let _ = self.tx.send(ShardCommand::HandOff);
    }

    pub(crate) fn state(&self, reply: oneshot::Sender<BTreeSet<EntityId>>) {
        let _ = self.tx.send(ShardCommand::GetState(reply));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AcquiringLease,
    LoadingEntities,
    Active,
    HandingOff,
}

struct Shard {
    deps: ShardDeps,
    shard_id: ShardId,
    tx: mpsc::UnboundedSender<ShardCommand>,
    phase: Phase,
    lease: Option<LeaseGuard>,
    /// Bumped on every acquisition so callbacks from older leases are ignored.
    lease_epoch: u64,
    lease_task: Option<JoinHandle<()>>,
    entities: HashMap<EntityId, EntityInstance>,
    next_generation: u64,
    buffer: MessageBuffer<EntityId, Delivery>,
    passivating: BTreeSet<EntityId>,
    remembered: BTreeSet<EntityId>,
    pending_starts: BTreeSet<EntityId>,
    pending_stops: BTreeSet<EntityId>,
    writing: Option<(BTreeSet<EntityId>, BTreeSet<EntityId>)>,
    stop_deadline: Option<Instant>,
}

impl Shard {
    fn new(deps: ShardDeps, shard_id: ShardId, tx: mpsc::UnboundedSender<ShardCommand>) -> Self {
        let lease = deps
            .lease
            .as_ref()
            .map(|provider| LeaseGuard::new(Arc::clone(provider), &deps.type_name, &shard_id, &deps.region));
        let buffer = MessageBuffer::new(deps.config.buffer_size);
        Self {
            deps,
            shard_id,
            tx,
            phase: Phase::AcquiringLease,
            lease,
            lease_epoch: 0,
            lease_task: None,
            entities: HashMap::new(),
            next_generation: 0,
            buffer,
            passivating: BTreeSet::new(),
            remembered: BTreeSet::new(),
            pending_starts: BTreeSet::new(),
            pending_stops: BTreeSet::new(),
            writing: None,
            stop_deadline: None,
        }
    }

    fn idle_after(&self) -> Option<Duration> {
        if self.deps.remember.is_some() {
            return None;
        }
        self.deps.config.passivate_idle_after
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ShardCommand>) {
        tracing::debug!(type_name = %self.deps.type_name, shard_id = %self.shard_id, "shard starting");
        self.start_activation();

        let idle_after = self.idle_after();
        let mut idle_tick =
            tokio::time::interval(idle_after.unwrap_or(self.deps.config.retry_interval));

        loop {
            let deadline = self.stop_deadline;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => {
                        if self.handle(command) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = idle_tick.tick(), if idle_after.is_some() && self.phase == Phase::Active => {
                    if let Some(idle) = idle_after {
                        self.passivate_idle(idle);
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.force_stop();
                    break;
                }
            }
        }
        self.finish().await;
    }

    /// Returns true once handoff has completed.
    fn handle(&mut self, command: ShardCommand) -> bool {
        match command {
            ShardCommand::Deliver {
                envelope,
                originator,
            } => {
                self.deliver(envelope.entity_id, Delivery {
                    envelope: envelope.envelope,
                    originator,
                });
                false
            }
            ShardCommand::HandOff => self.begin_handoff(),
            ShardCommand::GetState(reply) => {
                let _ = reply.send(self.entities.keys().cloned().collect());
                false
            }
            ShardCommand::Passivate(entity_id) => {
                self.passivate(&entity_id);
                false
            }
            ShardCommand::EntityStopped {
                entity_id,
                generation,
            } => self.entity_stopped(entity_id, generation),
            ShardCommand::LeaseAcquired { epoch } => {
                if epoch == self.lease_epoch && self.phase == Phase::AcquiringLease {
                    tracing::debug!(shard_id = %self.shard_id, "shard lease acquired");
                    self.lease_task = None;
                    self.load_entities();
                }
                false
            }
            ShardCommand::LeaseLost { epoch, reason } => {
                self.lease_lost(epoch, reason);
                false
            }
            ShardCommand::EntitiesLoaded(result) => {
                self.entities_loaded(result);
                false
            }
            ShardCommand::RememberWritten(result) => {
                self.remember_written(result);
                false
            }
            ShardCommand::RetryLoad => {
                if self.phase == Phase::LoadingEntities {
                    self.load_entities();
                }
                false
            }
            ShardCommand::RetryRemember => {
                self.write_remembered();
                false
            }
            ShardCommand::RestartEntity(entity_id) => {
                if self.phase == Phase::Active
                    && self.remembered.contains(&entity_id)
                    && !self.entities.contains_key(&entity_id)
                    && !self.is_writing(&entity_id)
                {
                    self.start_entity(entity_id);
                }
                false
            }
        }
    }

    fn start_activation(&mut self) {
        if self.lease.is_some() {
            self.phase = Phase::AcquiringLease;
            self.acquire_lease();
        } else {
            self.load_entities();
        }
    }

    /// Keep trying for the lease in the background until it is ours.
    fn acquire_lease(&mut self) {
        let Some(guard) = self.lease.clone() else {
            return;
        };
        self.lease_epoch += 1;
        let epoch = self.lease_epoch;
        let retry_interval = self
            .deps
            .config
            .lease
            .as_ref()
            .map_or(self.deps.config.retry_interval, |l| l.retry_interval);
        let tx = self.tx.clone();
        let lost_tx = self.tx.clone();
        let on_lost: LeaseLostCallback = Arc::new(move |reason| {
            let _ = lost_tx.send(ShardCommand::LeaseLost { epoch, reason });
        });
        let shard_id = self.shard_id.clone();
        if let Some(previous) = self.lease_task.take() {
            previous.abort();
        }
        self.lease_task = Some(tokio::spawn(async move {
            loop {
                if guard.try_acquire(Arc::clone(&on_lost)).await {
                    let _ = tx.send(ShardCommand::LeaseAcquired { epoch });
                    return;
                }
                tracing::info!(
                    shard_id = %shard_id,
                    lease_id = guard.lease_id(),
                    retry_in = ?retry_interval,
                    "shard lease not acquired"
                );
                tokio::time::sleep(retry_interval).await;
            }
        }));
    }

    fn lease_lost(&mut self, epoch: u64, reason: Option<String>) {
        if epoch != self.lease_epoch
            || matches!(self.phase, Phase::AcquiringLease | Phase::HandingOff)
        {
            return;
        }
        tracing::warn!(
            shard_id = %self.shard_id,
            reason = reason.as_deref().unwrap_or("unknown"),
            entities = self.entities.len(),
            "shard lease lost, stopping entities"
        );
        self.abort_entities();
        self.phase = Phase::AcquiringLease;
        self.acquire_lease();
    }

    fn load_entities(&mut self) {
        let Some(store) = self.deps.remember.clone() else {
            self.activate(BTreeSet::new());
            return;
        };
        self.phase = Phase::LoadingEntities;
        let tx = self.tx.clone();
        let shard_id = self.shard_id.clone();
        tokio::spawn(async move {
            let result = store.get_entities(&shard_id).await;
            let _ = tx.send(ShardCommand::EntitiesLoaded(result));
        });
    }

    fn entities_loaded(&mut self, result: Result<BTreeSet<EntityId>, ShardingError>) {
        if self.phase != Phase::LoadingEntities {
            return;
        }
        match result {
            Ok(ids) => self.activate(ids),
            Err(e) => {
                tracing::warn!(shard_id = %self.shard_id, error = %e, "loading remembered entities failed, retrying");
                self.schedule(ShardCommand::RetryLoad);
            }
        }
    }

    fn activate(&mut self, remembered: BTreeSet<EntityId>) {
        self.phase = Phase::Active;
        tracing::info!(
            type_name = %self.deps.type_name,
            shard_id = %self.shard_id,
            remembered = remembered.len(),
            buffered = self.buffer.len(),
            "shard active"
        );
        self.remembered = remembered;
        let restart: Vec<EntityId> = self
            .remembered
            .iter()
            .filter(|id| !self.entities.contains_key(*id))
            .cloned()
            .collect();
        for entity_id in restart {
            self.start_entity(entity_id);
        }
        for entity_id in self.buffer.keys() {
            self.resume(&entity_id);
        }
    }

    fn deliver(&mut self, entity_id: EntityId, delivery: Delivery) {
        let direct = self.phase == Phase::Active
            && !self.passivating.contains(&entity_id)
            && !self.buffer.contains(&entity_id);
        if direct {
            if let Some(instance) = self.entities.get_mut(&entity_id) {
                if let Err(delivery) = instance.deliver(delivery) {
                    self.enqueue(entity_id, delivery);
                }
                return;
            }
        }
        self.enqueue(entity_id.clone(), delivery);
        if self.phase == Phase::Active {
            self.resume(&entity_id);
        }
    }

    fn enqueue(&mut self, entity_id: EntityId, delivery: Delivery) {
        if let Err(delivery) = self.buffer.push(entity_id, delivery) {
            tracing::warn!(shard_id = %self.shard_id, capacity = self.deps.config.buffer_size, "shard buffer full");
            delivery.originator.fail(ShardingError::BufferOverflow {
                shard_id: self.shard_id.clone(),
                capacity: self.deps.config.buffer_size,
            });
        }
    }

    /// Move an entity with buffered messages towards running.
    fn resume(&mut self, entity_id: &EntityId) {
        if self.entities.contains_key(entity_id) {
            if !self.passivating.contains(entity_id) {
                self.flush(entity_id);
            }
            return;
        }
        if self.is_writing(entity_id) {
            return;
        }
        if self.deps.remember.is_some() && !self.remembered.contains(entity_id) {
            self.pending_starts.insert(entity_id.clone());
            self.write_remembered();
        } else {
            self.start_entity(entity_id.clone());
        }
    }

    fn start_entity(&mut self, entity_id: EntityId) {
        self.next_generation += 1;
        let ctx = EntityContext::new(
            EntityAddress {
                type_name: self.deps.type_name.clone(),
                shard_id: self.shard_id.clone(),
                entity_id: entity_id.clone(),
            },
            self.deps.region.clone(),
            CancellationToken::new(),
            self.tx.clone(),
        );
        let instance = EntityInstance::spawn(
            Arc::clone(&self.deps.entity),
            ctx,
            self.tx.clone(),
            self.next_generation,
        );
        self.entities.insert(entity_id.clone(), instance);
        self.entities_gauge().inc();
        self.flush(&entity_id);
    }

    fn flush(&mut self, entity_id: &EntityId) {
        let mut queue = self.buffer.take(entity_id);
        let Some(instance) = self.entities.get_mut(entity_id) else {
            for delivery in queue {
                self.enqueue(entity_id.clone(), delivery);
            }
            return;
        };
        while let Some(delivery) = queue.pop_front() {
            if let Err(delivery) = instance.deliver(delivery) {
                // Exited under us; keep the rest for the restart.
                queue.push_front(delivery);
                for delivery in queue {
                    self.enqueue(entity_id.clone(), delivery);
                }
                return;
            }
        }
    }

    fn is_writing(&self, entity_id: &EntityId) -> bool {
        self.pending_starts.contains(entity_id)
            || self.pending_stops.contains(entity_id)
            || self
                .writing
                .as_ref()
                .is_some_and(|(started, stopped)| {
                    started.contains(entity_id) || stopped.contains(entity_id)
                })
    }

    /// Start one batched write of queued starts and stops unless one is
    /// already in flight.
    fn write_remembered(&mut self) {
        if self.writing.is_some() || (self.pending_starts.is_empty() && self.pending_stops.is_empty()) {
            return;
        }
        let Some(store) = self.deps.remember.clone() else {
            return;
        };
        let started = std::mem::take(&mut self.pending_starts);
        let stopped = std::mem::take(&mut self.pending_stops);
        self.writing = Some((started.clone(), stopped.clone()));
        let tx = self.tx.clone();
        let shard_id = self.shard_id.clone();
        tokio::spawn(async move {
            let result = store.update(&shard_id, &started, &stopped).await;
            let _ = tx.send(ShardCommand::RememberWritten(result));
        });
    }

    fn remember_written(&mut self, result: Result<(), ShardingError>) {
        let Some((started, stopped)) = self.writing.take() else {
            return;
        };
        match result {
            Ok(()) => {
                tracing::debug!(
                    shard_id = %self.shard_id,
                    started = started.len(),
                    stopped = stopped.len(),
                    "remembered entities updated"
                );
                for entity_id in &stopped {
                    self.remembered.remove(entity_id);
                }
                self.remembered.extend(started.iter().cloned());
                if self.phase == Phase::Active {
                    for entity_id in started.iter().chain(stopped.iter()) {
                        if self.buffer.contains(entity_id)
                            || (started.contains(entity_id) && !self.entities.contains_key(entity_id))
                        {
                            self.resume(entity_id);
                        }
                    }
                }
                self.write_remembered();
            }
            Err(e) => {
                tracing::error!(shard_id = %self.shard_id, error = %e, "remembering entities failed");
                for entity_id in &started {
                    for delivery in self.buffer.take(entity_id) {
                        delivery.originator.fail(ShardingError::EntityFailure {
                            entity_id: entity_id.clone(),
                            reason: format!("could not remember entity: {e}"),
                        });
                    }
                }
                self.pending_stops.extend(stopped);
                self.schedule(ShardCommand::RetryRemember);
            }
        }
    }

    fn passivate(&mut self, entity_id: &EntityId) {
        if self.phase != Phase::Active || self.passivating.contains(entity_id) {
            return;
        }
        if let Some(instance) = self.entities.get(entity_id) {
            tracing::debug!(shard_id = %self.shard_id, entity_id = %entity_id, "passivating entity");
            self.passivating.insert(entity_id.clone());
            instance.stop();
        }
    }

    fn passivate_idle(&mut self, idle: Duration) {
        let now = Instant::now();
        let idle_ids: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(id, instance)| {
                !self.buffer.contains(*id) && now.duration_since(instance.last_active) >= idle
            })
            .map(|(id, _)| id.clone())
            .collect();
        for entity_id in idle_ids {
            self.passivate(&entity_id);
        }
    }

    /// Returns true when this was the last entity of a shard being handed off.
    fn entity_stopped(&mut self, entity_id: EntityId, generation: u64) -> bool {
        match self.entities.get(&entity_id) {
            Some(instance) if instance.generation == generation => {}
            _ => return false,
        }
        self.entities.remove(&entity_id);
        self.entities_gauge().dec();
        let passivated = self.passivating.remove(&entity_id);

        if self.phase == Phase::HandingOff {
            return self.entities.is_empty();
        }
        if self.phase != Phase::Active {
            return false;
        }
        if passivated {
            if self.deps.remember.is_some() && self.remembered.contains(&entity_id) {
                self.pending_stops.insert(entity_id);
                self.write_remembered();
            } else if self.buffer.contains(&entity_id) {
                self.resume(&entity_id);
            }
        } else if self.buffer.contains(&entity_id) {
            self.resume(&entity_id);
        } else if self.deps.remember.is_some() && self.remembered.contains(&entity_id) {
            tracing::debug!(shard_id = %self.shard_id, entity_id = %entity_id, "remembered entity stopped, restarting");
            self.schedule(ShardCommand::RestartEntity(entity_id));
        }
        false
    }

    /// Returns true when there is nothing left to stop.
    fn begin_handoff(&mut self) -> bool {
        if self.phase == Phase::HandingOff {
            return false;
        }
        tracing::debug!(shard_id = %self.shard_id, entities = self.entities.len(), "shard handing off");
        if let Some(task) = self.lease_task.take() {
            task.abort();
        }
        self.phase = Phase::HandingOff;
        if self.entities.is_empty() {
            return true;
        }
        for instance in self.entities.values() {
            instance.stop();
        }
        self.stop_deadline = Some(Instant::now() + self.deps.config.entity_stop_timeout);
        false
    }

    fn force_stop(&mut self) {
        tracing::warn!(
            shard_id = %self.shard_id,
            remaining = self.entities.len(),
            timeout = ?self.deps.config.entity_stop_timeout,
            "entities did not stop in time, terminating"
        );
        self.abort_entities();
    }

    fn abort_entities(&mut self) {
        let aborted = self.entities.len();
        for (_, instance) in self.entities.drain() {
            instance.abort();
        }
        self.entities_gauge().sub(aborted as i64);
        self.passivating.clear();
    }

    async fn finish(mut self) {
        if let Some(task) = self.lease_task.take() {
            task.abort();
        }
        if let Some(guard) = &self.lease {
            guard.release().await;
        }
        let leftovers: Vec<(ShardEnvelope, Originator)> = self
            .buffer
            .drain()
            .into_iter()
            .flat_map(|(entity_id, queue)| {
                let shard_id = self.shard_id.clone();
                queue.into_iter().map(move |delivery| {
                    (
                        ShardEnvelope {
                            shard_id: shard_id.clone(),
                            entity_id: entity_id.clone(),
                            envelope: delivery.envelope,
                        },
                        delivery.originator,
                    )
                })
            })
            .collect();
        tracing::debug!(shard_id = %self.shard_id, returned = leftovers.len(), "shard stopped");
        let _ = self.deps.region_tx.send(RegionCommand::ShardTerminated {
            shard_id: self.shard_id,
            leftovers,
        });
    }

    /// Send a command to this shard after the retry interval.
    fn schedule(&self, command: ShardCommand) {
        let tx = self.tx.clone();
        let delay = self.deps.config.retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command);
        });
    }

    fn entities_gauge(&self) -> prometheus::IntGauge {
        self.deps
            .metrics
            .entities
            .with_label_values(&[self.deps.type_name.as_ref()])
    }
}
