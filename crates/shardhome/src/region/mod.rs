//! The per-node front door for one sharded type.
//!
//! A region resolves shard homes through the coordinator, caches them, and
//! routes envelopes to local shards or to the region owning them. Envelopes
//! for shards without a known home are buffered per shard in receipt order
//! and flushed once the home arrives. A region in proxy mode routes but
//! never hosts.

mod handle;


pub use handle::{RegionHandle, RegionState, TellReceipt};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::buffer::MessageBuffer;
use crate::config::ShardingConfig;
use crate::entity::Entity;
use crate::envelope::{Envelope, Originator, RequestId, ShardEnvelope};
use crate::error::{DeliveryFailure, ShardingError};
use crate::extractor::MessageExtractor;
use crate::lease::LeaseProvider;
use crate::membership::{Membership, MembershipEvent, MembershipStream};
use crate::metrics::ShardingMetrics;
use crate::protocol::{CoordinatorMessage, RegionMessage, ReplyTo};
use crate::remember::RememberEntitiesStore;
use crate::shard::{ShardDeps, ShardHandle};
use crate::transport::{Outbox, Transport};
use crate::types::{EntityId, RegionAddress, ShardId, TypeName};

/// Commands from the local side: handles and shard processes.
#[derive(Debug)]
pub(crate) enum RegionCommand {
    Deliver {
        envelope: Envelope,
        originator: Originator,
    },
    /// A shard finished handing off. Messages it still held go back through
    /// routing ahead of anything buffered since.
    ShardTerminated {
        shard_id: ShardId,
        leftovers: Vec<(ShardEnvelope, Originator)>,
    },
    State(oneshot::Sender<RegionState>),
    GracefulShutdown(oneshot::Sender<()>),
}

/// What a hosting region needs beyond routing.
#[derive(Clone)]
pub(crate) struct HostingDeps {
    pub entity: Arc<dyn Entity>,
    pub lease: Option<Arc<dyn LeaseProvider>>,
    pub remember: Option<Arc<dyn RememberEntitiesStore>>,
}

pub(crate) struct RegionDeps {
    pub type_name: TypeName,
    pub node: RegionAddress,
    pub config: Arc<ShardingConfig>,
    pub extractor: Arc<dyn MessageExtractor>,
    pub transport: Arc<dyn Transport>,
    pub membership: Arc<dyn Membership>,
    pub metrics: Arc<ShardingMetrics>,
    /// `None` runs the region as a proxy.
    pub hosting: Option<HostingDeps>,
}

pub(crate) struct ShardRegion {
    type_name: TypeName,
    node: RegionAddress,
    config: Arc<ShardingConfig>,
    extractor: Arc<dyn MessageExtractor>,
    transport: Arc<dyn Transport>,
    metrics: Arc<ShardingMetrics>,
    /// Template for new shards; `None` in proxy mode.
    shard_deps: Option<ShardDeps>,
    outbox: Outbox,
    members: BTreeSet<RegionAddress>,
    coordinator: Option<RegionAddress>,
    registered: bool,
    region_by_shard: BTreeMap<ShardId, RegionAddress>,
    shards_by_region: BTreeMap<RegionAddress, BTreeSet<ShardId>>,
    shards: BTreeMap<ShardId, ShardHandle>,
    /// `HandOff` received; waiting for the shard process to finish.
    handing_off: BTreeSet<ShardId>,
    buffer: MessageBuffer<ShardId, (ShardEnvelope, Originator)>,
    /// Outstanding `GetShardHome` requests with their resend count.
    home_requests: BTreeMap<ShardId, u32>,
    next_seq: u64,
    /// Asks forwarded to another region, by sequence number.
    pending_replies: HashMap<u64, (RegionAddress, Originator)>,
    graceful: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl ShardRegion {
    /// Bind the region's inbox and start its process.
    pub(crate) async fn spawn(deps: RegionDeps) -> Result<RegionHandle, ShardingError> {
        let events = deps.membership.subscribe().await?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        deps.transport
            .bind_region(&deps.type_name, &deps.node, inbox_tx);

        let handle = RegionHandle::new(
            deps.type_name.clone(),
            deps.node.clone(),
            commands_tx.clone(),
            deps.config.ask_timeout,
            cancel.clone(),
        );
        let shard_deps = deps.hosting.map(|hosting| ShardDeps {
            type_name: deps.type_name.clone(),
            region: deps.node.clone(),
            entity: hosting.entity,
            config: Arc::clone(&deps.config),
            lease: hosting.lease,
            remember: hosting.remember,
            metrics: Arc::clone(&deps.metrics),
            region_tx: commands_tx,
        });
        let region = Self {
            outbox: Outbox::new(Arc::clone(&deps.transport), deps.type_name.clone()),
            buffer: MessageBuffer::new(deps.config.buffer_size),
            type_name: deps.type_name,
            node: deps.node,
            config: deps.config,
            extractor: deps.extractor,
            transport: deps.transport,
            metrics: deps.metrics,
            shard_deps,
            members: BTreeSet::new(),
            coordinator: None,
            registered: false,
            region_by_shard: BTreeMap::new(),
            shards_by_region: BTreeMap::new(),
            shards: BTreeMap::new(),
            handing_off: BTreeSet::new(),
            home_requests: BTreeMap::new(),
            next_seq: 0,
            pending_replies: HashMap::new(),
            graceful: false,
            shutdown_waiters: Vec::new(),
            cancel,
        };
        tracing::info!(
            type_name = %region.type_name,
            region = %region.node,
            proxy = region.is_proxy(),
            "shard region started"
        );
        tokio::spawn(region.run(inbox_rx, commands_rx, events));
        Ok(handle)
    }

    fn is_proxy(&self) -> bool {
        self.shard_deps.is_none()
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<RegionMessage>,
        mut commands: mpsc::UnboundedReceiver<RegionCommand>,
        mut events: MembershipStream,
    ) {
        let mut retry_tick = tokio::time::interval(self.config.retry_interval);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => self.on_membership(event),
                    None => {
                        tracing::warn!(type_name = %self.type_name, "membership stream ended, stopping region");
                        break;
                    }
                },
                Some(message) = inbox.recv() => self.on_message(message),
                Some(command) = commands.recv() => {
                    if self.on_command(command) {
                        break;
                    }
                }
                _ = retry_tick.tick() => self.retry_tick(),
            }
        }
        self.stop();
    }

    fn on_membership(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::CurrentClusterState { members, leader } => {
                self.members = members;
                self.set_coordinator(leader);
            }
            MembershipEvent::NodeUp(node) => {
                self.members.insert(node);
            }
            MembershipEvent::NodeDown(node) => {
                self.members.remove(&node);
                self.node_down(&node);
            }
            MembershipEvent::LeaderChanged(leader) => self.set_coordinator(leader),
        }
    }

    fn set_coordinator(&mut self, leader: Option<RegionAddress>) {
        if self.coordinator == leader {
            return;
        }
        tracing::debug!(type_name = %self.type_name, coordinator = ?leader, "coordinator changed");
        self.coordinator = leader;
        self.registered = false;
        self.register();
    }

    fn register(&mut self) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        let message = if self.is_proxy() {
            CoordinatorMessage::RegisterProxy {
                proxy: self.node.clone(),
            }
        } else {
            CoordinatorMessage::Register {
                region: self.node.clone(),
            }
        };
        self.outbox.to_coordinator(&coordinator, message);
    }

    fn to_coordinator(&mut self, message: CoordinatorMessage) {
        match self.coordinator.clone() {
            Some(coordinator) => self.outbox.to_coordinator(&coordinator, message),
            None => tracing::debug!(kind = message.kind(), "no coordinator known, message dropped"),
        }
    }

    fn node_down(&mut self, node: &RegionAddress) {
        if let Some(shards) = self.shards_by_region.remove(node) {
            for shard_id in shards {
                self.region_by_shard.remove(&shard_id);
            }
        }
        let lost: Vec<u64> = self
            .pending_replies
            .iter()
            .filter(|(_, (target, _))| target == node)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in lost {
            if let Some((_, originator)) = self.pending_replies.remove(&seq) {
                originator.fail(ShardingError::RegionUnavailable {
                    address: node.clone(),
                    source: None,
                });
            }
        }
        self.outbox.forget(node);
    }

    fn on_message(&mut self, message: RegionMessage) {
        match message {
            RegionMessage::RegisterAck { coordinator } => {
                tracing::debug!(type_name = %self.type_name, coordinator = %coordinator, "registered with coordinator");
                self.registered = true;
                let pending: Vec<ShardId> = self.home_requests.keys().cloned().collect();
                for shard_id in pending {
                    self.send_home_request(&shard_id);
                }
            }
            RegionMessage::ShardHome { shard_id, region } => self.home_received(shard_id, region),
            RegionMessage::HostShard { shard_id } => self.host_shard(shard_id),
            RegionMessage::BeginHandOff { shard_id } => {
                tracing::debug!(shard_id = %shard_id, "begin handoff");
                self.forget_home(&shard_id);
                self.to_coordinator(CoordinatorMessage::BeginHandOffAck {
                    shard_id,
                    region: self.node.clone(),
                });
            }
            RegionMessage::HandOff { shard_id } => self.hand_off(shard_id),
            RegionMessage::Deliver { envelope, reply_to } => self.remote_deliver(envelope, reply_to),
            RegionMessage::Reply { request_id, result } => {
                if request_id.origin != self.node {
                    return;
                }
                if let Some((_, originator)) = self.pending_replies.remove(&request_id.seq) {
                    originator.reply(result.map_err(ShardingError::from));
                }
            }
        }
    }

    /// Returns true when the region should stop.
    fn on_command(&mut self, command: RegionCommand) -> bool {
        match command {
            RegionCommand::Deliver {
                envelope,
                originator,
            } => {
                self.deliver(envelope, originator);
                false
            }
            RegionCommand::ShardTerminated {
                shard_id,
                leftovers,
            } => {
                self.shard_terminated(shard_id, leftovers);
                self.graceful_done()
            }
            RegionCommand::State(reply) => {
                self.collect_state(reply);
                false
            }
            RegionCommand::GracefulShutdown(done) => {
                self.shutdown_waiters.push(done);
                if !self.graceful {
                    tracing::info!(type_name = %self.type_name, region = %self.node, "region shutting down gracefully");
                    self.graceful = true;
                    if !self.is_proxy() {
                        self.to_coordinator(CoordinatorMessage::GracefulShutdownReq {
                            region: self.node.clone(),
                        });
                    }
                }
                self.graceful_done()
            }
        }
    }

    fn deliver(&mut self, envelope: Envelope, originator: Originator) {
        let Some(entity_id) = self.extractor.entity_id(&envelope) else {
            tracing::debug!(tag = %envelope.tag, "message without entity id");
            originator.fail(ShardingError::Unhandled {
                reason: format!("no entity id in message '{}'", envelope.tag),
            });
            return;
        };
        let shard_id = self.extractor.shard_id(&envelope);
        self.route(
            ShardEnvelope {
                shard_id,
                entity_id,
                envelope,
            },
            originator,
        );
    }

    fn route(&mut self, envelope: ShardEnvelope, originator: Originator) {
        let shard_id = envelope.shard_id.clone();
        // Stay behind whatever is already waiting for this shard.
        if self.buffer.contains(&shard_id) || self.handing_off.contains(&shard_id) {
            self.buffer_envelope(envelope, originator);
            return;
        }
        match self.region_by_shard.get(&shard_id).cloned() {
            Some(home) if home == self.node => self.deliver_local(envelope, originator),
            Some(home) => self.forward(&home, envelope, originator),
            None => {
                self.buffer_envelope(envelope, originator);
                self.request_home(&shard_id);
            }
        }
    }

    fn deliver_local(&mut self, envelope: ShardEnvelope, originator: Originator) {
        let shard_id = envelope.shard_id.clone();
        self.ensure_shard(&shard_id);
        match self.shards.get(&shard_id) {
            Some(shard) => {
                if let Err((_, originator)) = shard.deliver(envelope, originator) {
                    originator.fail(ShardingError::ShuttingDown);
                }
            }
            None => originator.fail(ShardingError::Unhandled {
                reason: format!("region {} cannot host shard {shard_id}", self.node),
            }),
        }
    }

    fn forward(&mut self, home: &RegionAddress, envelope: ShardEnvelope, originator: Originator) {
        let reply_to = match &originator {
            Originator::Tell(None) => None,
            Originator::Tell(Some(_)) => Some(ReplyTo::Acceptance(self.next_request_id())),
            Originator::Ask(_) => Some(ReplyTo::Response(self.next_request_id())),
        };
        if let Some(reply_to) = &reply_to {
            self.pending_replies
                .insert(reply_to.request_id().seq, (home.clone(), originator));
        }
        self.outbox
            .to_region(home, RegionMessage::Deliver { envelope, reply_to });
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_seq += 1;
        RequestId {
            origin: self.node.clone(),
            seq: self.next_seq,
        }
    }

    /// An envelope from another region. The outcome goes back to the origin
    /// when someone there is waiting for it.
    fn remote_deliver(&mut self, envelope: ShardEnvelope, reply_to: Option<ReplyTo>) {
        let transport = Arc::clone(&self.transport);
        let type_name = self.type_name.clone();
        match reply_to {
            None => self.route(envelope, Originator::none()),
            Some(ReplyTo::Response(request_id)) => {
                let (tx, rx) = oneshot::channel();
                self.route(envelope, Originator::Ask(tx));
                let ask_timeout = self.config.ask_timeout;
                tokio::spawn(async move {
                    let result = match tokio::time::timeout(ask_timeout, rx).await {
                        Ok(Ok(result)) => result.map_err(|e| DeliveryFailure::from(&e)),
                        Ok(Err(_)) => Err(DeliveryFailure::Other {
                            reason: "reply dropped".to_string(),
                        }),
                        Err(_) => Err(DeliveryFailure::Other {
                            reason: "timed out waiting for entity reply".to_string(),
                        }),
                    };
                    send_reply(transport, type_name, request_id, result).await;
                });
            }
            Some(ReplyTo::Acceptance(request_id)) => {
                let (tx, rx) = oneshot::channel();
                self.route(envelope, Originator::Tell(Some(tx)));
                // No deadline: a buffered tell is accepted or failed once its
                // shard home resolves or its retries run out.
                tokio::spawn(async move {
                    let result = match rx.await {
                        Ok(accepted) => accepted
                            .map(|()| Vec::new())
                            .map_err(|e| DeliveryFailure::from(&e)),
                        Err(_) => Err(DeliveryFailure::Other {
                            reason: "delivery dropped".to_string(),
                        }),
                    };
                    send_reply(transport, type_name, request_id, result).await;
                });
            }
        }
    }

    fn buffer_envelope(&mut self, envelope: ShardEnvelope, originator: Originator) {
        let shard_id = envelope.shard_id.clone();
        if let Err((_, originator)) = self.buffer.push(shard_id.clone(), (envelope, originator)) {
            tracing::warn!(
                shard_id = %shard_id,
                capacity = self.config.buffer_size,
                "region buffer full, dropping message"
            );
            originator.fail(ShardingError::BufferOverflow {
                shard_id,
                capacity: self.config.buffer_size,
            });
        }
        self.update_buffered();
    }

    fn request_home(&mut self, shard_id: &ShardId) {
        if self.home_requests.contains_key(shard_id) {
            return;
        }
        self.home_requests.insert(shard_id.clone(), 0);
        self.send_home_request(shard_id);
    }

    fn send_home_request(&mut self, shard_id: &ShardId) {
        self.to_coordinator(CoordinatorMessage::GetShardHome {
            shard_id: shard_id.clone(),
            region: self.node.clone(),
        });
    }

    #[instrument(level = "debug", skip(self), fields(type_name = %self.type_name))]
    fn home_received(&mut self, shard_id: ShardId, home: RegionAddress) {
        if home != self.node && !self.members.contains(&home) {
            tracing::debug!("ignoring home on a node that is not a member");
            return;
        }
        if self.handing_off.contains(&shard_id) || (home == self.node && self.is_proxy()) {
            return;
        }
        self.set_home(&shard_id, &home);
        self.home_requests.remove(&shard_id);
        if home == self.node {
            self.ensure_shard(&shard_id);
        }
        self.flush(&shard_id);
    }

    #[instrument(level = "debug", skip(self), fields(type_name = %self.type_name))]
    fn host_shard(&mut self, shard_id: ShardId) {
        if self.is_proxy() {
            tracing::warn!("proxy region asked to host a shard");
            return;
        }
        if self.handing_off.contains(&shard_id) {
            return;
        }
        let node = self.node.clone();
        self.set_home(&shard_id, &node);
        self.ensure_shard(&shard_id);
        self.to_coordinator(CoordinatorMessage::ShardStarted {
            shard_id: shard_id.clone(),
            region: node,
        });
        self.home_requests.remove(&shard_id);
        self.flush(&shard_id);
    }

    fn hand_off(&mut self, shard_id: ShardId) {
        self.forget_home(&shard_id);
        match self.shards.get(&shard_id) {
            Some(shard) => {
                if self.handing_off.insert(shard_id.clone()) {
                    tracing::debug!(shard_id = %shard_id, "handing off shard");
                    shard.hand_off();
                }
            }
            None => self.to_coordinator(CoordinatorMessage::ShardStopped {
                shard_id,
                region: self.node.clone(),
            }),
        }
    }

    fn shard_terminated(&mut self, shard_id: ShardId, leftovers: Vec<(ShardEnvelope, Originator)>) {
        self.shards.remove(&shard_id);
        self.update_hosted();
        if self.handing_off.remove(&shard_id) {
            tracing::debug!(shard_id = %shard_id, returned = leftovers.len(), "shard handed off");
            self.to_coordinator(CoordinatorMessage::ShardStopped {
                shard_id: shard_id.clone(),
                region: self.node.clone(),
            });
        }
        let later = self.buffer.take(&shard_id);
        for (envelope, originator) in leftovers.into_iter().chain(later) {
            self.buffer_envelope(envelope, originator);
        }
        if self.buffer.contains(&shard_id) {
            self.request_home(&shard_id);
        }
        self.update_buffered();
    }

    fn ensure_shard(&mut self, shard_id: &ShardId) {
        if self.shards.contains_key(shard_id) {
            return;
        }
        let Some(deps) = self.shard_deps.clone() else {
            return;
        };
        tracing::debug!(type_name = %self.type_name, shard_id = %shard_id, "starting shard");
        self.shards
            .insert(shard_id.clone(), ShardHandle::spawn(deps, shard_id.clone()));
        self.update_hosted();
    }

    fn set_home(&mut self, shard_id: &ShardId, home: &RegionAddress) {
        self.forget_home(shard_id);
        self.region_by_shard.insert(shard_id.clone(), home.clone());
        self.shards_by_region
            .entry(home.clone())
            .or_default()
            .insert(shard_id.clone());
    }

    fn forget_home(&mut self, shard_id: &ShardId) {
        if let Some(previous) = self.region_by_shard.remove(shard_id) {
            if let Some(shards) = self.shards_by_region.get_mut(&previous) {
                shards.remove(shard_id);
                if shards.is_empty() {
                    self.shards_by_region.remove(&previous);
                }
            }
        }
    }

    fn flush(&mut self, shard_id: &ShardId) {
        let queued = self.buffer.take(shard_id);
        if !queued.is_empty() {
            tracing::debug!(shard_id = %shard_id, count = queued.len(), "delivering buffered messages");
        }
        for (envelope, originator) in queued {
            self.route(envelope, originator);
        }
        self.update_buffered();
    }

    fn retry_tick(&mut self) {
        if !self.registered {
            self.register();
        }
        if self.graceful && !self.is_proxy() {
            self.to_coordinator(CoordinatorMessage::GracefulShutdownReq {
                region: self.node.clone(),
            });
        }

        let max_retries = self.config.shard_home_max_retries;
        let mut exhausted = Vec::new();
        let mut resend = Vec::new();
        for (shard_id, attempts) in self.home_requests.iter_mut() {
            *attempts += 1;
            if max_retries > 0 && *attempts > max_retries {
                exhausted.push((shard_id.clone(), *attempts));
            } else {
                resend.push(shard_id.clone());
            }
        }
        for shard_id in resend {
            self.send_home_request(&shard_id);
        }
        for (shard_id, attempts) in exhausted {
            self.home_requests.remove(&shard_id);
            let queued = self.buffer.take(&shard_id);
            tracing::warn!(
                shard_id = %shard_id,
                attempts,
                dropped = queued.len(),
                "no home for shard, failing buffered messages"
            );
            for (_, originator) in queued {
                originator.fail(ShardingError::ShardHomeUnavailable {
                    shard_id: shard_id.clone(),
                    attempts,
                });
            }
        }
        self.update_buffered();

        self.pending_replies
            .retain(|_, (_, originator)| !originator.is_closed());
    }

    fn collect_state(&self, reply: oneshot::Sender<RegionState>) {
        let pending: Vec<(ShardId, oneshot::Receiver<BTreeSet<EntityId>>)> = self
            .shards
            .iter()
            .filter(|(shard_id, _)| !self.handing_off.contains(*shard_id))
            .map(|(shard_id, shard)| {
                let (tx, rx) = oneshot::channel();
                shard.state(tx);
                (shard_id.clone(), rx)
            })
            .collect();
        tokio::spawn(async move {
            let mut shards = BTreeMap::new();
            for (shard_id, rx) in pending {
                if let Ok(entities) = rx.await {
                    shards.insert(shard_id, entities);
                }
            }
            let _ = reply.send(RegionState { shards });
        });
    }

    /// Finish a graceful shutdown once no shard is left.
    fn graceful_done(&mut self) -> bool {
        if !self.graceful || !self.shards.is_empty() {
            return false;
        }
        if !self.is_proxy() {
            self.to_coordinator(CoordinatorMessage::RegionStopped {
                region: self.node.clone(),
            });
        }
        true
    }

    fn stop(mut self) {
        for shard in self.shards.values() {
            shard.hand_off();
        }
        self.transport.unbind_region(&self.type_name, &self.node);
        for (_, queue) in self.buffer.drain() {
            for (_, originator) in queue {
                originator.fail(ShardingError::ShuttingDown);
            }
        }
        for (_, (_, originator)) in self.pending_replies.drain() {
            originator.fail(ShardingError::ShuttingDown);
        }
        self.metrics
            .hosted_shards
            .with_label_values(&[self.type_name.as_ref()])
            .set(0);
        self.update_buffered();
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::info!(type_name = %self.type_name, region = %self.node, "shard region stopped");
    }

    fn update_hosted(&self) {
        self.metrics
            .hosted_shards
            .with_label_values(&[self.type_name.as_ref()])
            .set(self.shards.len() as i64);
    }

    fn update_buffered(&self) {
        self.metrics
            .buffered
            .with_label_values(&[self.type_name.as_ref()])
            .set(self.buffer.len() as i64);
    }
}

async fn send_reply(
    transport: Arc<dyn Transport>,
    type_name: TypeName,
    request_id: RequestId,
    result: Result<Vec<u8>, DeliveryFailure>,
) {
    let origin = request_id.origin.clone();
    if let Err(e) = transport
        .send_to_region(&type_name, &origin, RegionMessage::Reply { request_id, result })
        .await
    {
        tracing::debug!(origin = %origin, error = %e, "reply undeliverable");
    }
}
