use async_trait::async_trait;
use dashmap::DashMap;

use super::{CoordinatorInbox, RegionInbox, Transport};
use crate::error::ShardingError;
use crate::protocol::{CoordinatorMessage, RegionMessage};
use crate::types::{RegionAddress, TypeName};

type Key = (TypeName, RegionAddress);

/// In-process transport: delivers straight into bound inboxes.
#[derive(Default)]
pub struct LocalTransport {
    regions: DashMap<Key, RegionInbox>,
    coordinators: DashMap<Key, CoordinatorInbox>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_region_bound(&self, type_name: &TypeName, address: &RegionAddress) -> bool {
        self.regions
            .contains_key(&(type_name.clone(), address.clone()))
    }

    pub fn is_coordinator_bound(&self, type_name: &TypeName, node: &RegionAddress) -> bool {
        self.coordinators
            .contains_key(&(type_name.clone(), node.clone()))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_to_region(
        &self,
        type_name: &TypeName,
        target: &RegionAddress,
        message: RegionMessage,
    ) -> Result<(), ShardingError> {
        let inbox = self
            .regions
            .get(&(type_name.clone(), target.clone()))
            .map(|entry| entry.value().clone());
        match inbox {
            Some(inbox) if inbox.send(message).is_ok() => Ok(()),
            _ => Err(ShardingError::RegionUnavailable {
                address: target.clone(),
                source: None,
            }),
        }
    }

    async fn send_to_coordinator(
        &self,
        type_name: &TypeName,
        node: &RegionAddress,
        message: CoordinatorMessage,
    ) -> Result<(), ShardingError> {
        let inbox = self
            .coordinators
            .get(&(type_name.clone(), node.clone()))
            .map(|entry| entry.value().clone());
        match inbox {
            Some(inbox) if inbox.send(message).is_ok() => Ok(()),
            _ => Err(ShardingError::CoordinatorUnavailable),
        }
    }

    fn bind_region(&self, type_name: &TypeName, address: &RegionAddress, inbox: RegionInbox) {
        self.regions
            .insert((type_name.clone(), address.clone()), inbox);
    }

    fn unbind_region(&self, type_name: &TypeName, address: &RegionAddress) {
        self.regions.remove(&(type_name.clone(), address.clone()));
    }

    fn bind_coordinator(&self, type_name: &TypeName, node: &RegionAddress, inbox: CoordinatorInbox) {
        self.coordinators
            .insert((type_name.clone(), node.clone()), inbox);
    }

    fn unbind_coordinator(&self, type_name: &TypeName, node: &RegionAddress) {
        self.coordinators.remove(&(type_name.clone(), node.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShardId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delivers_to_bound_region() {
        let transport = LocalTransport::new();
        let type_name = TypeName::new("T");
        let addr = RegionAddress::new("a", 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.bind_region(&type_name, &addr, tx);

        let msg = RegionMessage::HostShard {
            shard_id: ShardId::new("1"),
        };
        transport
            .send_to_region(&type_name, &addr, msg.clone())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn unbound_destinations_fail() {
        let transport = LocalTransport::new();
        let type_name = TypeName::new("T");
        let addr = RegionAddress::new("a", 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.bind_coordinator(&type_name, &addr, tx);
        transport.unbind_coordinator(&type_name, &addr);

        let err = transport
            .send_to_coordinator(
                &type_name,
                &addr,
                CoordinatorMessage::Register {
                    region: addr.clone(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::CoordinatorUnavailable));

        // Types are isolated from each other.
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.bind_region(&TypeName::new("Other"), &addr, tx);
        assert!(transport
            .send_to_region(&type_name, &addr, RegionMessage::HandOff { shard_id: ShardId::new("1") })
            .await
            .is_err());
    }
}
