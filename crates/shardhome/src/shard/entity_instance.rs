use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ShardCommand;
use crate::entity::{Entity, EntityContext};
use crate::envelope::{Envelope, Originator};
use crate::error::ShardingError;
use crate::types::{EntityAddress, EntityId};

pub(crate) struct Delivery {
    pub envelope: Envelope,
    pub originator: Originator,
}

pub(crate) enum EntityCommand {
    Deliver(Delivery),
    Stop,
}

/// Reports the instance as stopped however its task ends, including abort.
struct StoppedGuard {
    shard: mpsc::UnboundedSender<ShardCommand>,
    entity_id: EntityId,
    generation: u64,
}

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        let _ = self.shard.send(ShardCommand::EntityStopped {
            entity_id: self.entity_id.clone(),
            generation: self.generation,
        });
    }
}

/// One running entity: a task that owns the handler and drains a mailbox
/// serially.
pub(crate) struct EntityInstance {
    pub generation: u64,
    pub last_active: Instant,
    mailbox: mpsc::UnboundedSender<EntityCommand>,
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

impl EntityInstance {
    pub(crate) fn spawn(
        entity: Arc<dyn Entity>,
        ctx: EntityContext,
        shard: mpsc::UnboundedSender<ShardCommand>,
        generation: u64,
    ) -> Self {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let cancellation = ctx.cancellation.clone();
        let guard = StoppedGuard {
            shard,
            entity_id: ctx.address.entity_id.clone(),
            generation,
        };
        let task = tokio::spawn(run(entity, ctx, rx, guard));
        Self {
            generation,
            last_active: Instant::now(),
            mailbox,
            cancellation,
            task,
        }
    }

    /// Queue a message. The message comes back if the instance has already
    /// exited.
    pub(crate) fn deliver(&mut self, delivery: Delivery) -> Result<(), Delivery> {
        self.last_active = Instant::now();
        match self.mailbox.send(EntityCommand::Deliver(delivery)) {
            Ok(()) => Ok(()),
            Err(e) => match e.0 {
                EntityCommand::Deliver(delivery) => Err(delivery),
                EntityCommand::Stop => Ok(()),
            },
        }
    }

    /// Stop after the messages already queued.
    pub(crate) fn stop(&self) {
        let _ = self.mailbox.send(EntityCommand::Stop);
    }

    /// Terminate immediately, abandoning queued messages.
    pub(crate) fn abort(&self) {
        self.cancellation.cancel();
        self.task.abort();
    }
}

async fn run(
    entity: Arc<dyn Entity>,
    ctx: EntityContext,
    mut rx: mpsc::UnboundedReceiver<EntityCommand>,
    _guard: StoppedGuard,
) {
    let address: EntityAddress = ctx.address.clone();
    let mut handler = match entity.spawn(ctx).await {
        Ok(handler) => handler,
        Err(e) => {
            tracing::warn!(entity = %address, error = %e, "entity failed to start");
            rx.close();
            while let Some(command) = rx.recv().await {
                if let EntityCommand::Deliver(Delivery { originator, .. }) = command {
                    originator.fail(ShardingError::EntityFailure {
                        entity_id: address.entity_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            return;
        }
    };
    tracing::debug!(entity = %address, "entity started");

    while let Some(command) = rx.recv().await {
        match command {
            EntityCommand::Deliver(Delivery {
                envelope,
                originator,
            }) => {
                let waiting = originator.accepted();
                let result = handler
                    .handle_request(&envelope.tag, &envelope.payload, &envelope.headers)
                    .await;
                match waiting {
                    Some(originator) => originator.reply(result),
                    None => {
                        if let Err(e) = result {
                            tracing::debug!(entity = %address, tag = %envelope.tag, error = %e, "tell failed");
                        }
                    }
                }
            }
            EntityCommand::Stop => {
                handler.on_stop().await;
                break;
            }
        }
    }
    tracing::debug!(entity = %address, "entity stopped");
}
