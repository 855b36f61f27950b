use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::Transport;
use crate::protocol::{CoordinatorMessage, RegionMessage};
use crate::types::{RegionAddress, TypeName};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum Destination {
    Region(RegionAddress),
    Coordinator(RegionAddress),
}

enum Outgoing {
    Region(RegionMessage),
    Coordinator(CoordinatorMessage),
}

/// Non-blocking sender owned by a single process.
///
/// Each destination gets its own forwarding task so messages to one
/// destination keep their order while the owning loop never awaits a send.
/// Failed sends are logged and dropped.
pub(crate) struct Outbox {
    transport: Arc<dyn Transport>,
    type_name: TypeName,
    lanes: HashMap<Destination, mpsc::UnboundedSender<Outgoing>>,
}

impl Outbox {
    pub(crate) fn new(transport: Arc<dyn Transport>, type_name: TypeName) -> Self {
        Self {
            transport,
            type_name,
            lanes: HashMap::new(),
        }
    }

    pub(crate) fn to_region(&mut self, target: &RegionAddress, message: RegionMessage) {
        self.push(Destination::Region(target.clone()), Outgoing::Region(message));
    }

    pub(crate) fn to_coordinator(&mut self, node: &RegionAddress, message: CoordinatorMessage) {
        self.push(
            Destination::Coordinator(node.clone()),
            Outgoing::Coordinator(message),
        );
    }

    /// Drop the lane to a destination that left the cluster.
    pub(crate) fn forget(&mut self, node: &RegionAddress) {
        self.lanes.remove(&Destination::Region(node.clone()));
        self.lanes.remove(&Destination::Coordinator(node.clone()));
    }

    fn push(&mut self, destination: Destination, message: Outgoing) {
        let message = match self.lanes.get(&destination) {
            Some(lane) => match lane.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        let lane = self.spawn_lane(destination.clone());
        let _ = lane.send(message);
        self.lanes.insert(destination, lane);
    }

    fn spawn_lane(&self, destination: Destination) -> mpsc::UnboundedSender<Outgoing> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let transport = Arc::clone(&self.transport);
        let type_name = self.type_name.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let (kind, result) = match (&destination, message) {
                    (Destination::Region(target), Outgoing::Region(msg)) => {
                        let kind = msg.kind();
                        (kind, transport.send_to_region(&type_name, target, msg).await)
                    }
                    (Destination::Coordinator(node), Outgoing::Coordinator(msg)) => {
                        let kind = msg.kind();
                        (kind, transport.send_to_coordinator(&type_name, node, msg).await)
                    }
                    _ => continue,
                };
                if let Err(e) = result {
                    tracing::debug!(
                        type_name = %type_name,
                        destination = ?destination,
                        message = kind,
                        error = %e,
                        "dropping undeliverable message"
                    );
                }
            }
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use crate::types::ShardId;

    #[tokio::test]
    async fn preserves_order_per_destination() {
        let transport = Arc::new(LocalTransport::new());
        let type_name = TypeName::new("T");
        let addr = RegionAddress::new("a", 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.bind_region(&type_name, &addr, tx);

        let mut outbox = Outbox::new(transport, type_name);
        for i in 0..50 {
            outbox.to_region(
                &addr,
                RegionMessage::HostShard {
                    shard_id: ShardId::new(i.to_string()),
                },
            );
        }
        for i in 0..50 {
            assert_eq!(
                rx.recv().await.unwrap(),
                RegionMessage::HostShard {
                    shard_id: ShardId::new(i.to_string())
                }
            );
        }
    }

    #[tokio::test]
    async fn undeliverable_messages_do_not_block_others() {
        let transport = Arc::new(LocalTransport::new());
        let type_name = TypeName::new("T");
        let good = RegionAddress::new("good", 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.bind_region(&type_name, &good, tx);

        let mut outbox = Outbox::new(transport, type_name);
        outbox.to_region(
            &RegionAddress::new("gone", 1),
            RegionMessage::HandOff {
                shard_id: ShardId::new("1"),
            },
        );
        outbox.to_region(
            &good,
            RegionMessage::HandOff {
                shard_id: ShardId::new("2"),
            },
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            RegionMessage::HandOff {
                shard_id: ShardId::new("2")
            }
        );
    }
}
