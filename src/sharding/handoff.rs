//! The handoff stopper: a transient helper that stops a set of entries and
//! reports when all of them have terminated.

use futures::future::join_all;
use tracing::debug;

use super::entry::{Delivery, EntryRef, StopEntry};
use super::messages::{WorkerMessage, WorkerRef};
use super::ShardId;
use crate::actor::TaskSet;
use crate::internal::tokio::spawn_named;

/// Sends every entry the stop message, awaits all their terminations and
/// answers `ShardStopped` to `reply_to`. There is no timeout here; the
/// rebalance worker driving the handoff enforces one.
pub(crate) fn spawn_handoff_stopper(
    shard: ShardId,
    reply_to: WorkerRef,
    entries: Vec<EntryRef>,
    tasks: &TaskSet,
) {
    let handle = spawn_named("handoff_stopper::run", async move {
        debug!("[HandoffStopper {}] Stopping {} entries", shard, entries.len());

        for entry in &entries {
            entry.send(Delivery {
                message: Box::new(StopEntry),
                sender: None,
            });
        }

        join_all(entries.iter().map(|entry| entry.closed())).await;

        debug!("[HandoffStopper {}] All entries terminated", shard);
        reply_to.send(WorkerMessage::ShardStopped { shard });
    });
    tasks.track(handle);
}
