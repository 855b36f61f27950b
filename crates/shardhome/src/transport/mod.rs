//! Message delivery between regions and coordinators.
//!
//! Every process receives protocol messages through an unbounded inbox bound
//! at an address. A [`Transport`] carries messages to those inboxes; the
//! in-process [`LocalTransport`] is used for tests and single-process
//! clusters, while a networked transport would serialize the serde
//! protocol types and deliver them to the remote node's inbox.

mod local;
mod outbox;

pub use local::LocalTransport;
pub(crate) use outbox::Outbox;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ShardingError;
use crate::protocol::{CoordinatorMessage, RegionMessage};
use crate::types::{RegionAddress, TypeName};

pub type RegionInbox = mpsc::UnboundedSender<RegionMessage>;
pub type CoordinatorInbox = mpsc::UnboundedSender<CoordinatorMessage>;

/// At-most-once delivery of protocol messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver to the region of `type_name` on node `target`.
    async fn send_to_region(
        &self,
        type_name: &TypeName,
        target: &RegionAddress,
        message: RegionMessage,
    ) -> Result<(), ShardingError>;

    /// Deliver to the coordinator of `type_name` running on node `node`.
    async fn send_to_coordinator(
        &self,
        type_name: &TypeName,
        node: &RegionAddress,
        message: CoordinatorMessage,
    ) -> Result<(), ShardingError>;

    fn bind_region(&self, type_name: &TypeName, address: &RegionAddress, inbox: RegionInbox);

    fn unbind_region(&self, type_name: &TypeName, address: &RegionAddress);

    fn bind_coordinator(&self, type_name: &TypeName, node: &RegionAddress, inbox: CoordinatorInbox);

    fn unbind_coordinator(&self, type_name: &TypeName, node: &RegionAddress);
}
