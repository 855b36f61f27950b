use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::RegionCommand;
use crate::envelope::{Envelope, Originator};
use crate::error::ShardingError;
use crate::types::{EntityId, RegionAddress, ShardId, TypeName};

/// Shards hosted by a region and the entities running in each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionState {
    pub shards: BTreeMap<ShardId, BTreeSet<EntityId>>,
}

/// Acknowledgement of a `tell`: resolves once the message reached an entity
/// mailbox, here or on the region owning its shard, or with the reason it
/// could not be.
#[derive(Debug)]
pub struct TellReceipt {
    rx: oneshot::Receiver<Result<(), ShardingError>>,
}

impl TellReceipt {
    pub async fn confirmed(self) -> Result<(), ShardingError> {
        self.rx.await.map_err(|_| ShardingError::ReplyDropped)?
    }
}

/// Client side of a running shard region.
#[derive(Debug, Clone)]
pub struct RegionHandle {
    type_name: TypeName,
    address: RegionAddress,
    commands: mpsc::UnboundedSender<RegionCommand>,
    ask_timeout: Duration,
    cancel: CancellationToken,
}

impl RegionHandle {
    pub(crate) fn new(
        type_name: TypeName,
        address: RegionAddress,
        commands: mpsc::UnboundedSender<RegionCommand>,
        ask_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            type_name,
            address,
            commands,
            ask_timeout,
            cancel,
        }
    }

    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    pub fn address(&self) -> &RegionAddress {
        &self.address
    }

    /// Fire-and-forget send. Dropping the receipt is fine.
    pub fn tell(&self, envelope: Envelope) -> Result<TellReceipt, ShardingError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegionCommand::Deliver {
            envelope,
            originator: Originator::Tell(Some(tx)),
        })?;
        Ok(TellReceipt { rx })
    }

    /// Send and wait for the entity's reply, bounded by `ask_timeout`.
    pub async fn ask(&self, envelope: Envelope) -> Result<Vec<u8>, ShardingError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegionCommand::Deliver {
            envelope,
            originator: Originator::Ask(tx),
        })?;
        match tokio::time::timeout(self.ask_timeout, rx).await {
            Ok(reply) => reply.map_err(|_| ShardingError::ReplyDropped)?,
            Err(_) => Err(ShardingError::Timeout {
                operation: format!("ask to {}", self.type_name),
            }),
        }
    }

    /// [`ask`](Self::ask) and decode the MessagePack reply.
    pub async fn ask_decoded<T: DeserializeOwned>(&self, envelope: Envelope) -> Result<T, ShardingError> {
        let bytes = self.ask(envelope).await?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    pub async fn state(&self) -> Result<RegionState, ShardingError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegionCommand::State(tx))?;
        rx.await.map_err(|_| ShardingError::ReplyDropped)
    }

    /// Move every hosted shard away through the coordinator, then stop.
    pub async fn graceful_shutdown(&self) -> Result<(), ShardingError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegionCommand::GracefulShutdown(tx))?;
        rx.await.map_err(|_| ShardingError::ShuttingDown)
    }

    /// Stop immediately. Hosted shards hand off locally and release their
    /// leases; buffered messages fail with `ShuttingDown`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: RegionCommand) -> Result<(), ShardingError> {
        self.commands
            .send(command)
            .map_err(|_| ShardingError::ShuttingDown)
    }
}
