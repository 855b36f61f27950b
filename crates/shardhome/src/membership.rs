use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ShardingError;
use crate::types::RegionAddress;

/// Ordered cluster membership and leadership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Snapshot delivered as the first event of every subscription.
    CurrentClusterState {
        members: BTreeSet<RegionAddress>,
        leader: Option<RegionAddress>,
    },
    NodeUp(RegionAddress),
    /// The node is gone for good; everything it owned must move.
    NodeDown(RegionAddress),
    LeaderChanged(Option<RegionAddress>),
}

pub type MembershipStream = Pin<Box<dyn Stream<Item = MembershipEvent> + Send>>;

/// Membership, failure detection and leader election, consumed as an event
/// stream. Coordinator and regions subscribe independently.
#[async_trait]
pub trait Membership: Send + Sync {
    /// Subscribe to membership changes. The first event is always
    /// `CurrentClusterState`.
    async fn subscribe(&self) -> Result<MembershipStream, ShardingError>;
}

/// Member set tracked from a membership stream.
#[derive(Debug, Default, Clone)]
pub(crate) struct MemberView {
    pub members: BTreeSet<RegionAddress>,
    pub leader: Option<RegionAddress>,
}

impl MemberView {
    pub(crate) fn apply(&mut self, event: &MembershipEvent) {
        match event {
            MembershipEvent::CurrentClusterState { members, leader } => {
                self.members = members.clone();
                self.leader = leader.clone();
            }
            MembershipEvent::NodeUp(node) => {
                self.members.insert(node.clone());
            }
            MembershipEvent::NodeDown(node) => {
                self.members.remove(node);
            }
            MembershipEvent::LeaderChanged(leader) => {
                self.leader = leader.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_view_tracks_events() {
        let a = RegionAddress::new("a", 1);
        let b = RegionAddress::new("b", 1);
        let mut view = MemberView::default();
        view.apply(&MembershipEvent::CurrentClusterState {
            members: BTreeSet::from([a.clone()]),
            leader: Some(a.clone()),
        });
        view.apply(&MembershipEvent::NodeUp(b.clone()));
        view.apply(&MembershipEvent::NodeDown(a.clone()));
        view.apply(&MembershipEvent::LeaderChanged(Some(b.clone())));
        assert_eq!(view.members, BTreeSet::from([b.clone()]));
        assert_eq!(view.leader, Some(b));
    }
}
