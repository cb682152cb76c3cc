//! The wire-observable protocol between regions, shards, the coordinator
//! and its rebalance workers, one mailbox enum per receiving role.
//!
//! Replies carry explicit reply handles instead of an ambient sender, so a
//! message can always be answered to the unit that asked, no matter how
//! many hops it took.

use super::coordinator::state::RegionKey;
use super::entry::{Message, Recipient};
use super::region::RegionRef;
use super::shard::EntryEvent;
use super::{EntryId, ShardId};
use crate::actor::{ActorId, Ref};
use crate::cluster::MemberEvent;

pub(crate) type CoordinatorRef = Ref<CoordinatorMessage>;
pub(crate) type ShardRef = Ref<ShardMessage>;
pub(crate) type WorkerRef = Ref<WorkerMessage>;

/// Messages accepted by the shard coordinator.
#[derive(Debug)]
pub(crate) enum CoordinatorMessage {
    /// A hosting region announces itself; answered with `RegisterAck`.
    Register(RegionRef),
    /// A proxy-only region announces itself; answered with `RegisterAck`.
    RegisterProxy(RegionRef),
    /// Asks for the home of a shard, allocating one if needed. `from` is
    /// absent for the coordinator's own reallocation requests, which need
    /// no `ShardHome` reply.
    GetShardHome {
        shard: ShardId,
        from: Option<RegionRef>,
    },
    /// A region confirms that it hosts the shard; stops the `HostShard`
    /// resend timer.
    ShardStarted { shard: ShardId },
    /// A rebalance worker finished, successfully or not. Unknown shards
    /// are ignored so late workers are harmless.
    RebalanceDone { shard: ShardId, ok: bool },
    /// Resend timer fired for an unacknowledged `HostShard`.
    ResendShardHost { shard: ShardId, region: RegionKey },
    /// Death-watch notification for a registered region.
    RegionTerminated(RegionRef),
    /// Death-watch notification for a registered proxy.
    ProxyTerminated(RegionRef),
    RebalanceTick,
    SnapshotTick,
}

/// Messages accepted by a shard region.
pub(crate) enum RegionMessage {
    /// An application message to route, with its preserved sender.
    Route {
        message: Message,
        sender: Option<Recipient>,
    },
    /// The coordinator acknowledges registration.
    RegisterAck { coordinator: CoordinatorRef },
    /// The coordinator instructs this region to host a shard; answered
    /// with `ShardStarted`.
    HostShard { shard: ShardId },
    /// The coordinator answers a `GetShardHome`.
    ShardHome { shard: ShardId, region: RegionRef },
    /// A rebalance worker asks this region to forget the shard's location;
    /// answered with `BeginHandOffAck`.
    BeginHandOff { shard: ShardId, reply_to: WorkerRef },
    /// A rebalance worker asks the owning region to stop the shard;
    /// eventually answered with `ShardStopped`.
    HandOff { shard: ShardId, reply_to: WorkerRef },
    /// A membership change observed on the cluster.
    Cluster(MemberEvent),
    /// Periodic retry tick: re-register or re-request buffered homes.
    Retry,
    /// Death-watch notification for the coordinator.
    CoordinatorTerminated(CoordinatorRef),
    /// Death-watch notification for a remote region.
    RegionTerminated(RegionRef),
    /// Death-watch notification for a locally hosted shard.
    ShardTerminated { shard: ShardId, id: ActorId },
}

/// Messages accepted by a shard.
pub(crate) enum ShardMessage {
    /// An application message for one of this shard's entries.
    Route {
        message: Message,
        sender: Option<Recipient>,
    },
    /// An entry asks to be stopped gracefully; `stop_message` is forwarded
    /// to it while new messages are diverted into a buffer.
    Passivate {
        entry: EntryId,
        stop_message: Message,
    },
    /// Stop all entries and reply `ShardStopped` when done.
    HandOff { shard: ShardId, reply_to: WorkerRef },
    /// Death-watch notification for an entry.
    EntryTerminated { entry: EntryId, id: ActorId },
    /// Backoff expired for an entry that stopped without passivating.
    RestartEntry { entry: EntryId },
    /// Backoff expired for a failed persistence write; try it again.
    RetryPersistence { change: EntryEvent },
    SnapshotTick,
}

/// Messages accepted by a rebalance worker.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    BeginHandOffAck { shard: ShardId, from: RegionRef },
    ShardStopped { shard: ShardId },
}
