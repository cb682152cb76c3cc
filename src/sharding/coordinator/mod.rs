//! The shard coordinator: the event-sourced cluster singleton owning the
//! shard-to-region mapping.
//!
//! Every decision the coordinator makes is persisted as a domain event
//! before it takes effect, and
//! recovery replays the log, re-watches the surviving regions and re-issues
//! `HostShard` for everything already allocated.

pub mod allocation;
pub(crate) mod rebalance;
pub(crate) mod singleton;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::allocation::AllocationStrategy;
use self::rebalance::RebalanceWorker;
use self::state::{CoordinatorEvent, CoordinatorState, RegionKey};
use super::messages::{CoordinatorMessage, CoordinatorRef, RegionMessage};
use super::region::RegionRef;
use super::settings::ShardingSettings;
use super::ShardId;
use crate::actor::{mailbox, schedule_once, schedule_repeating, watch as watch_unit, Mailbox, TaskSet};
use crate::cluster::Cluster;
use crate::internal::prelude::*;
use crate::persistence::{EventSourced, Journal};

pub(crate) struct CoordinatorOptions {
    pub type_name: String,
    pub path: String,
    pub persistence_id: String,
    pub settings: Arc<ShardingSettings>,
    pub cluster: Cluster,
    pub strategy: Arc<dyn AllocationStrategy>,
    pub journal: Arc<dyn Journal>,
    pub tasks: Arc<TaskSet>,
    pub stop: watch::Receiver<bool>,
}

pub(crate) struct ShardCoordinator {
    type_name: String,
    settings: Arc<ShardingSettings>,
    cluster: Cluster,
    strategy: Arc<dyn AllocationStrategy>,
    journal: EventSourced,
    tasks: Arc<TaskSet>,
    state: CoordinatorState,
    /// Key-to-handle resolution for every known region and proxy.
    live: HashMap<RegionKey, RegionRef>,
    rebalance_in_progress: HashSet<ShardId>,
    /// Resend timers for `HostShard` messages not yet answered with
    /// `ShardStarted`.
    unacked_host_shards: HashMap<ShardId, JoinHandle<()>>,
    self_ref: CoordinatorRef,
    rx: Mailbox<CoordinatorMessage>,
    stop: watch::Receiver<bool>,
    timers: Vec<JoinHandle<()>>,
}

impl ShardCoordinator {
    pub(crate) fn new(options: CoordinatorOptions) -> (CoordinatorRef, Self) {
        let (self_ref, rx) = mailbox(options.path);

        let coordinator = Self {
            type_name: options.type_name,
            settings: options.settings,
            cluster: options.cluster,
            strategy: options.strategy,
            journal: EventSourced::new(options.journal, options.persistence_id),
            tasks: options.tasks,
            state: CoordinatorState::default(),
            live: HashMap::new(),
            rebalance_in_progress: HashSet::new(),
            unacked_host_shards: HashMap::new(),
            self_ref: self_ref.clone(),
            rx,
            stop: options.stop,
            timers: Vec::new(),
        };

        (self_ref, coordinator)
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        self.recover().await?;

        self.timers.push(schedule_repeating(
            self.settings.rebalance_interval,
            &self.self_ref,
            || CoordinatorMessage::RebalanceTick,
        ));
        self.timers.push(schedule_repeating(
            self.settings.snapshot_interval,
            &self.self_ref,
            || CoordinatorMessage::SnapshotTick,
        ));

        let result = self.run_loop().await;
        self.cleanup();

        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        if *self.stop.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    info!("[Coordinator {}] Stopping on handover", self.type_name);
                    return Ok(());
                },
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Replays the event log, re-resolves region handles, re-watches the
    /// live ones and re-issues `HostShard` for every allocated shard.
    /// Regions whose path no longer resolves are terminated right after.
    async fn recover(&mut self) -> Result<()> {
        self.state = self
            .journal
            .recover(CoordinatorState::default(), |state: CoordinatorState, event| {
                state.updated(&event)
            })
            .await?;

        info!(
            "[Coordinator {}] Recovered: {} regions, {} proxies, {} allocated, {} unallocated",
            self.type_name,
            self.state.regions.len(),
            self.state.region_proxies.len(),
            self.state.shards.len(),
            self.state.unallocated_shards.len()
        );

        let mut dead: Vec<(RegionKey, bool)> = Vec::new();

        let region_keys: Vec<RegionKey> = self.state.regions.keys().cloned().collect();
        for key in region_keys {
            match self.lookup_region(&key) {
                Some(region) => self.watch_region(region, false),
                None => dead.push((key, false)),
            }
        }
        let proxy_keys: Vec<RegionKey> = self.state.region_proxies.iter().cloned().collect();
        for key in proxy_keys {
            match self.lookup_region(&key) {
                Some(region) => self.watch_region(region, true),
                None => dead.push((key, true)),
            }
        }

        let allocated: Vec<(ShardId, RegionKey)> = self
            .state
            .shards
            .iter()
            .map(|(shard, key)| (shard.clone(), key.clone()))
            .collect();
        for (shard, key) in allocated {
            if let Some(region) = self.live.get(&key).cloned() {
                self.send_host_shard(shard, &region);
            }
        }

        for (key, proxy) in dead {
            self.terminate_region_key(key, proxy).await?;
        }
        self.allocate_shard_homes();

        Ok(())
    }

    fn lookup_region(&self, key: &RegionKey) -> Option<RegionRef> {
        self.cluster
            .registry()
            .lookup::<RegionRef>(key.as_str())
            .filter(|region| !region.0.is_closed())
    }

    /// Installs `region` as the live handle for its key and watches it for
    /// termination.
    fn watch_region(&mut self, region: RegionRef, proxy: bool) {
        let previous = self.live.insert(region.key(), region.clone());
        if previous.is_some_and(|p| p.id() == region.id()) {
            return;
        }

        let subject = region.0.clone();
        watch_unit(&subject, &self.self_ref, move || {
            if proxy {
                CoordinatorMessage::ProxyTerminated(region)
            } else {
                CoordinatorMessage::RegionTerminated(region)
            }
        });
    }

    async fn handle(&mut self, message: CoordinatorMessage) -> Result<()> {
        match message {
            CoordinatorMessage::Register(region) => self.register(region, false).await,
            CoordinatorMessage::RegisterProxy(region) => self.register(region, true).await,
            CoordinatorMessage::GetShardHome { shard, from } => {
                self.get_shard_home(shard, from).await
            },
            CoordinatorMessage::ShardStarted { shard } => {
                if let Some(timer) = self.unacked_host_shards.remove(&shard) {
                    timer.abort();
                }
                Ok(())
            },
            CoordinatorMessage::RebalanceDone { shard, ok } => self.rebalance_done(shard, ok).await,
            CoordinatorMessage::ResendShardHost { shard, region } => {
                self.resend_shard_host(shard, region);
                Ok(())
            },
            CoordinatorMessage::RegionTerminated(region) => {
                self.region_terminated(region, false).await
            },
            CoordinatorMessage::ProxyTerminated(region) => self.region_terminated(region, true).await,
            CoordinatorMessage::RebalanceTick => {
                self.rebalance_tick();
                Ok(())
            },
            CoordinatorMessage::SnapshotTick => {
                self.snapshot().await;
                Ok(())
            },
        }
    }

    /// Persists `event` and folds it into the state. A journal failure
    /// propagates out of the run loop; the supervisor restarts the
    /// coordinator, which then recovers from whatever reached the log.
    async fn persist(&mut self, event: CoordinatorEvent) -> Result<()> {
        self.journal.persist(&event).await?;
        self.state = self.state.updated(&event);

        Ok(())
    }

    async fn register(&mut self, region: RegionRef, proxy: bool) -> Result<()> {
        let key = region.key();
        let known = if proxy {
            self.state.region_proxies.contains(&key)
        } else {
            self.state.regions.contains_key(&key)
        };
        let first_region = !proxy && self.state.regions.is_empty();

        if known {
            debug!("[Coordinator {}] {} re-registered", self.type_name, key);
        } else {
            info!(
                "[Coordinator {}] {} registered: {}",
                self.type_name,
                if proxy { "Proxy" } else { "Region" },
                key
            );
            let event = if proxy {
                CoordinatorEvent::ShardRegionProxyRegistered { region: key.clone() }
            } else {
                CoordinatorEvent::ShardRegionRegistered { region: key.clone() }
            };
            self.persist(event).await?;
        }

        // Refresh the live handle either way; a restarted region comes
        // back under the same path with a new identity.
        self.watch_region(region.clone(), proxy);
        region.send_raw(RegionMessage::RegisterAck {
            coordinator: self.self_ref.clone(),
        });

        if first_region && !known {
            self.allocate_shard_homes();
        }

        Ok(())
    }

    async fn get_shard_home(&mut self, shard: ShardId, from: Option<RegionRef>) -> Result<()> {
        if self.rebalance_in_progress.contains(&shard) {
            debug!(
                "[Coordinator {}] GetShardHome for {} ignored, rebalance in progress",
                self.type_name, shard
            );
            return Ok(());
        }

        if let Some(key) = self.state.shards.get(&shard) {
            if let (Some(from), Some(region)) = (&from, self.live.get(key)) {
                from.send_raw(RegionMessage::ShardHome {
                    shard,
                    region: region.clone(),
                });
            }
            return Ok(());
        }

        if self.state.regions.is_empty() {
            debug!(
                "[Coordinator {}] GetShardHome for {} ignored, no regions registered",
                self.type_name, shard
            );
            return Ok(());
        }

        let requester = from.as_ref().map(RegionRef::key);
        let Some(key) = self.strategy.allocate(requester.as_ref(), &shard, &self.state.regions)
        else {
            warn!(
                "[Coordinator {}] Allocation strategy found no region for shard {}",
                self.type_name, shard
            );
            return Ok(());
        };
        if !self.state.regions.contains_key(&key) {
            error!(
                "[Coordinator {}] Allocation strategy returned unknown region {} for shard {}",
                self.type_name, key, shard
            );
            return Ok(());
        }
        let Some(region) = self.live.get(&key).cloned() else {
            warn!(
                "[Coordinator {}] Allocated region {} has no live handle",
                self.type_name, key
            );
            return Ok(());
        };

        info!("[Coordinator {}] Allocated shard {} to {}", self.type_name, shard, key);
        self.persist(CoordinatorEvent::ShardHomeAllocated {
            shard: shard.clone(),
            region: key,
        })
        .await?;

        self.send_host_shard(shard.clone(), &region);
        if let Some(from) = from {
            from.send_raw(RegionMessage::ShardHome { shard, region });
        }

        Ok(())
    }

    fn send_host_shard(&mut self, shard: ShardId, region: &RegionRef) {
        debug!("[Coordinator {}] HostShard {} to {}", self.type_name, shard, region.path());

        region.send_raw(RegionMessage::HostShard { shard: shard.clone() });

        let timer = schedule_once(
            self.settings.shard_start_timeout,
            &self.self_ref,
            CoordinatorMessage::ResendShardHost {
                shard: shard.clone(),
                region: region.key(),
            },
        );
        if let Some(previous) = self.unacked_host_shards.insert(shard, timer) {
            previous.abort();
        }
    }

    /// The region may have missed the `HostShard`; repeat it while the
    /// allocation still stands.
    fn resend_shard_host(&mut self, shard: ShardId, region: RegionKey) {
        self.unacked_host_shards.remove(&shard);

        let still_allocated = self.state.shards.get(&shard) == Some(&region);
        if !still_allocated {
            return;
        }
        if let Some(region) = self.live.get(&region).cloned() {
            self.send_host_shard(shard, &region);
        }
    }

    async fn region_terminated(&mut self, region: RegionRef, proxy: bool) -> Result<()> {
        let key = region.key();
        if self.live.get(&key).map_or(true, |current| current.id() != region.id()) {
            // Stale watch notification for a replaced incarnation.
            return Ok(());
        }

        if proxy {
            if self.state.region_proxies.contains(&key) {
                info!("[Coordinator {}] Proxy {} terminated", self.type_name, key);
                self.persist(CoordinatorEvent::ShardRegionProxyTerminated { region: key.clone() })
                    .await?;
                self.live.remove(&key);
            }
            return Ok(());
        }

        if let Some(shards) = self.state.regions.get(&key).cloned() {
            info!(
                "[Coordinator {}] Region {} terminated with {} shards",
                self.type_name,
                key,
                shards.len()
            );

            // Queue reallocation requests; they are processed after the
            // termination event below has moved the shards out.
            for shard in shards {
                self.self_ref.send(CoordinatorMessage::GetShardHome { shard, from: None });
            }

            self.persist(CoordinatorEvent::ShardRegionTerminated { region: key.clone() }).await?;
            self.live.remove(&key);
            self.allocate_shard_homes();
        }

        Ok(())
    }

    async fn terminate_region_key(&mut self, key: RegionKey, proxy: bool) -> Result<()> {
        if proxy {
            info!("[Coordinator {}] Proxy {} gone after recovery", self.type_name, key);
            self.persist(CoordinatorEvent::ShardRegionProxyTerminated { region: key }).await
        } else {
            info!("[Coordinator {}] Region {} gone after recovery", self.type_name, key);
            self.persist(CoordinatorEvent::ShardRegionTerminated { region: key }).await
        }
    }

    fn rebalance_tick(&mut self) {
        if self.state.regions.is_empty() {
            return;
        }

        let candidates = self.strategy.rebalance(&self.state.regions, &self.rebalance_in_progress);
        for shard in candidates {
            let Some(key) = self.state.shards.get(&shard) else {
                continue;
            };
            let Some(from) = self.live.get(key).cloned() else {
                continue;
            };

            info!(
                "[Coordinator {}] Rebalancing shard {} away from {}",
                self.type_name, shard, key
            );
            self.rebalance_in_progress.insert(shard.clone());

            let regions: Vec<RegionRef> = self.live.values().cloned().collect();
            RebalanceWorker::spawn(
                shard,
                from,
                self.settings.handoff_timeout,
                regions,
                self.self_ref.clone(),
                &self.tasks,
            );
        }
    }

    async fn rebalance_done(&mut self, shard: ShardId, ok: bool) -> Result<()> {
        if !self.rebalance_in_progress.remove(&shard) {
            // A worker outliving its rebalance round; nothing to do.
            debug!("[Coordinator {}] Late RebalanceDone for {}", self.type_name, shard);
            return Ok(());
        }

        info!("[Coordinator {}] Rebalance of {} done, ok = {}", self.type_name, shard, ok);

        if ok && self.state.shards.contains_key(&shard) {
            self.persist(CoordinatorEvent::ShardHomeDeallocated { shard }).await?;
            self.allocate_shard_homes();
        }

        Ok(())
    }

    /// Self-sends a home request for every unallocated shard.
    fn allocate_shard_homes(&mut self) {
        for shard in self.state.unallocated_shards.clone() {
            self.self_ref.send(CoordinatorMessage::GetShardHome { shard, from: None });
        }
    }

    async fn snapshot(&mut self) {
        debug!("[Coordinator {}] Saving snapshot", self.type_name);

        if let Err(why) = self.journal.save_snapshot(&self.state).await {
            warn!("[Coordinator {}] Saving snapshot failed: {}", self.type_name, why);
        }
    }

    fn cleanup(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        for (_, timer) in self.unacked_host_shards.drain() {
            timer.abort();
        }
    }
}
