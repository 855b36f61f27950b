//! Messages exchanged between shard regions and the shard coordinator.
//!
//! All messages are plain serde types so any [`Transport`](crate::transport::Transport)
//! can carry them. Delivery is at-most-once; every request that matters is
//! re-sent on the region's or coordinator's retry tick.

use crate::envelope::{RequestId, ShardEnvelope};
use crate::error::DeliveryFailure;
use crate::types::{RegionAddress, ShardId};
use serde::{Deserialize, Serialize};

/// Messages handled by the shard coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordinatorMessage {
    /// A hosting region announces itself. Answered with `RegisterAck`.
    Register { region: RegionAddress },
    /// A proxy region announces itself. Proxies never host shards.
    RegisterProxy { proxy: RegionAddress },
    /// Where does this shard live? Answered with `ShardHome` once known.
    GetShardHome {
        shard_id: ShardId,
        region: RegionAddress,
    },
    /// A region finished starting a shard after `HostShard`.
    ShardStarted {
        shard_id: ShardId,
        region: RegionAddress,
    },
    /// A region (or proxy) dropped its cached home for a shard in rebalance.
    BeginHandOffAck {
        shard_id: ShardId,
        region: RegionAddress,
    },
    /// The owning region stopped every entity of a shard after `HandOff`.
    ShardStopped {
        shard_id: ShardId,
        region: RegionAddress,
    },
    /// A region wants to leave: move all of its shards elsewhere.
    GracefulShutdownReq { region: RegionAddress },
    /// A region or proxy stopped.
    RegionStopped { region: RegionAddress },
}

impl CoordinatorMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorMessage::Register { .. } => "Register",
            CoordinatorMessage::RegisterProxy { .. } => "RegisterProxy",
            CoordinatorMessage::GetShardHome { .. } => "GetShardHome",
            CoordinatorMessage::ShardStarted { .. } => "ShardStarted",
            CoordinatorMessage::BeginHandOffAck { .. } => "BeginHandOffAck",
            CoordinatorMessage::ShardStopped { .. } => "ShardStopped",
            CoordinatorMessage::GracefulShutdownReq { .. } => "GracefulShutdownReq",
            CoordinatorMessage::RegionStopped { .. } => "RegionStopped",
        }
    }
}

/// Messages handled by a shard region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegionMessage {
    /// The coordinator accepted a registration.
    RegisterAck { coordinator: RegionAddress },
    /// Authoritative answer to `GetShardHome`.
    ShardHome {
        shard_id: ShardId,
        region: RegionAddress,
    },
    /// Start the shard now, without waiting for traffic.
    HostShard { shard_id: ShardId },
    /// A shard is about to move: forget its home and buffer new traffic.
    BeginHandOff { shard_id: ShardId },
    /// Stop every entity of the shard and answer `ShardStopped`.
    HandOff { shard_id: ShardId },
    /// An envelope routed from another region. `reply_to` is unset only
    /// when nobody is waiting on the outcome.
    Deliver {
        envelope: ShardEnvelope,
        reply_to: Option<ReplyTo>,
    },
    /// The outcome of a remote delivery.
    Reply {
        request_id: RequestId,
        result: Result<Vec<u8>, DeliveryFailure>,
    },
}

/// What the receiving region reports back for a forwarded envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyTo {
    /// The entity's reply to an ask.
    Response(RequestId),
    /// Acceptance of a tell into an entity mailbox, or why it was refused.
    Acceptance(RequestId),
}

impl ReplyTo {
    pub fn request_id(&self) -> &RequestId {
        match self {
            ReplyTo::Response(id) | ReplyTo::Acceptance(id) => id,
        }
    }
}

impl RegionMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RegionMessage::RegisterAck { .. } => "RegisterAck",
            RegionMessage::ShardHome { .. } => "ShardHome",
            RegionMessage::HostShard { .. } => "HostShard",
            RegionMessage::BeginHandOff { .. } => "BeginHandOff",
            RegionMessage::HandOff { .. } => "HandOff",
            RegionMessage::Deliver { .. } => "Deliver",
            RegionMessage::Reply { .. } => "Reply",
        }
    }
}
