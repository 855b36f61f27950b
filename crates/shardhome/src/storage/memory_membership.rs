use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ShardingError;
use crate::membership::{Membership, MembershipEvent, MembershipStream};
use crate::types::RegionAddress;

/// In-memory membership for testing and single-process clusters.
///
/// The first node added becomes leader. When the leader is removed the
/// lowest remaining address takes over.
pub struct MemoryMembership {
    inner: Mutex<Inner>,
}

struct Inner {
    members: BTreeSet<RegionAddress>,
    leader: Option<RegionAddress>,
    watchers: Vec<mpsc::UnboundedSender<MembershipEvent>>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                members: BTreeSet::new(),
                leader: None,
                watchers: Vec::new(),
            }),
        }
    }

    pub fn add_node(&self, node: RegionAddress) {
        let mut inner = self.inner.lock();
        if !inner.members.insert(node.clone()) {
            return;
        }
        Self::notify(&mut inner, MembershipEvent::NodeUp(node.clone()));
        if inner.leader.is_none() {
            inner.leader = Some(node.clone());
            Self::notify(&mut inner, MembershipEvent::LeaderChanged(Some(node)));
        }
    }

    pub fn remove_node(&self, node: &RegionAddress) {
        let mut inner = self.inner.lock();
        if !inner.members.remove(node) {
            return;
        }
        Self::notify(&mut inner, MembershipEvent::NodeDown(node.clone()));
        if inner.leader.as_ref() == Some(node) {
            let next = inner.members.iter().next().cloned();
            inner.leader = next.clone();
            Self::notify(&mut inner, MembershipEvent::LeaderChanged(next));
        }
    }

    /// Force leadership to a member, or to nobody.
    pub fn set_leader(&self, leader: Option<RegionAddress>) {
        let mut inner = self.inner.lock();
        if let Some(l) = &leader {
            if !inner.members.contains(l) {
                return;
            }
        }
        if inner.leader == leader {
            return;
        }
        inner.leader = leader.clone();
        Self::notify(&mut inner, MembershipEvent::LeaderChanged(leader));
    }

    pub fn members(&self) -> BTreeSet<RegionAddress> {
        self.inner.lock().members.clone()
    }

    pub fn leader(&self) -> Option<RegionAddress> {
        self.inner.lock().leader.clone()
    }

    fn notify(inner: &mut Inner, event: MembershipEvent) {
        inner.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for MemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Membership for MemoryMembership {
    async fn subscribe(&self) -> Result<MembershipStream, ShardingError> {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        // Snapshot and registration happen under one lock so no event is
        // missed or duplicated.
        let _ = tx.send(MembershipEvent::CurrentClusterState {
            members: inner.members.clone(),
            leader: inner.leader.clone(),
        });
        inner.watchers.push(tx);
        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }
}
