//! The rebalance worker: a transient helper driving the handoff of one
//! shard, spawned by the coordinator per rebalance decision.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use super::super::messages::{CoordinatorMessage, CoordinatorRef, RegionMessage, WorkerMessage, WorkerRef};
use super::super::region::RegionRef;
use super::super::ShardId;
use crate::actor::{mailbox, ActorId, Mailbox, TaskSet};
use crate::internal::tokio::spawn_named;

pub(crate) struct RebalanceWorker {
    shard: ShardId,
    from: RegionRef,
    regions: Vec<RegionRef>,
    coordinator: CoordinatorRef,
    self_ref: WorkerRef,
    rx: Mailbox<WorkerMessage>,
    deadline: Instant,
}

impl RebalanceWorker {
    /// Spawns a worker that hands `shard` off from `from`, reporting
    /// `RebalanceDone` to the coordinator either way.
    pub(crate) fn spawn(
        shard: ShardId,
        from: RegionRef,
        handoff_timeout: Duration,
        regions: Vec<RegionRef>,
        coordinator: CoordinatorRef,
        tasks: &TaskSet,
    ) {
        let (self_ref, rx) = mailbox(format!("{}/rebalance/{}", coordinator.path(), shard));

        let worker = Self {
            shard,
            from,
            regions,
            coordinator,
            self_ref,
            rx,
            deadline: Instant::now() + handoff_timeout,
        };

        tasks.track(spawn_named("rebalance_worker::run", async move {
            worker.run().await;
        }));
    }

    async fn run(mut self) {
        info!("[RebalanceWorker {}] Starting handoff from {}", self.shard, self.from.path());

        for region in &self.regions {
            region.send_raw(RegionMessage::BeginHandOff {
                shard: self.shard.clone(),
                reply_to: self.self_ref.clone(),
            });
        }

        let ok = self.hand_off().await;

        if !ok {
            info!("[RebalanceWorker {}] Handoff timed out", self.shard);
        }
        self.coordinator.send(CoordinatorMessage::RebalanceDone {
            shard: self.shard.clone(),
            ok,
        });
    }

    /// Collects one `BeginHandOffAck` per region, then tells the owning
    /// region to hand off and waits for `ShardStopped`. `false` on
    /// timeout.
    async fn hand_off(&mut self) -> bool {
        let mut remaining: HashSet<ActorId> = self.regions.iter().map(RegionRef::id).collect();

        while !remaining.is_empty() {
            match timeout_at(self.deadline, self.rx.recv()).await {
                Ok(Some(WorkerMessage::BeginHandOffAck { shard, from })) if shard == self.shard => {
                    remaining.remove(&from.id());
                },
                Ok(Some(other)) => {
                    debug!("[RebalanceWorker {}] Ignoring {:?} while collecting acks", self.shard, other);
                },
                Ok(None) | Err(_) => return false,
            }
        }

        debug!("[RebalanceWorker {}] All regions acknowledged, handing off", self.shard);
        self.from.send_raw(RegionMessage::HandOff {
            shard: self.shard.clone(),
            reply_to: self.self_ref.clone(),
        });

        loop {
            match timeout_at(self.deadline, self.rx.recv()).await {
                Ok(Some(WorkerMessage::ShardStopped { shard })) if shard == self.shard => {
                    return true;
                },
                Ok(Some(other)) => {
                    debug!("[RebalanceWorker {}] Ignoring {:?} while stopping", self.shard, other);
                },
                Ok(None) | Err(_) => return false,
            }
        }
    }
}
