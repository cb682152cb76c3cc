//! A shard region: the per-node router for one entry type.
//!
//! The region resolves shard locations through the coordinator, buffers
//! messages for shards whose home is not yet known, hosts shards the
//! coordinator assigns to it, and forwards everything else to the owning
//! remote region.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::coordinator::state::RegionKey;
use super::entry::{DeadLetters, Delivery, EntryFactory, Message, MessageExtractor, Recipient};
use super::messages::{
    CoordinatorMessage,
    CoordinatorRef,
    RegionMessage,
    ShardMessage,
    ShardRef,
    WorkerMessage,
    WorkerRef,
};
use super::settings::ShardingSettings;
use super::shard::{Shard, ShardOptions};
use super::{coordinator_singleton_path, ShardId};
use crate::actor::{mailbox, schedule_repeating, watch, ActorId, Mailbox, Ref, TaskSet};
use crate::cluster::{Cluster, Member, MemberEvent};
use crate::internal::prelude::*;
use crate::internal::tokio::spawn_named;
use crate::persistence::Journal;

/// The routing endpoint of one entry type on one node, as returned by
/// [`ClusterSharding::start`].
///
/// [`ClusterSharding::start`]: super::ClusterSharding::start
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegionRef(pub(crate) Ref<RegionMessage>);

impl RegionRef {
    /// Hands a message to the region for routing, preserving `sender` all
    /// the way to the addressed entry.
    ///
    /// `message` is boxed here; pass the application's concrete message
    /// type, not an already-boxed one.
    pub fn route(&self, message: impl Any + Send, sender: Option<Recipient>) -> bool {
        self.0.send(RegionMessage::Route {
            message: Box::new(message),
            sender,
        })
    }

    /// The region's logical path.
    pub fn path(&self) -> &str {
        self.0.path()
    }

    pub(crate) fn id(&self) -> ActorId {
        self.0.id()
    }

    pub(crate) fn key(&self) -> RegionKey {
        RegionKey::new(self.0.path())
    }

    pub(crate) fn send_raw(&self, message: RegionMessage) -> bool {
        self.0.send(message)
    }
}

pub(crate) struct RegionOptions {
    pub type_name: String,
    pub settings: Arc<ShardingSettings>,
    pub cluster: Cluster,
    pub role: Option<String>,
    pub extractor: Arc<dyn MessageExtractor>,
    /// `None` makes this a proxy-only region: it routes but never hosts.
    pub factory: Option<Arc<dyn EntryFactory>>,
    pub remember_entries: bool,
    pub journal: Arc<dyn Journal>,
    pub dead_letters: Arc<DeadLetters>,
    pub tasks: Arc<TaskSet>,
}

pub(crate) struct ShardRegion {
    type_name: String,
    settings: Arc<ShardingSettings>,
    cluster: Cluster,
    role: Option<String>,
    extractor: Arc<dyn MessageExtractor>,
    factory: Option<Arc<dyn EntryFactory>>,
    remember_entries: bool,
    journal: Arc<dyn Journal>,
    dead_letters: Arc<DeadLetters>,
    tasks: Arc<TaskSet>,
    self_ref: RegionRef,
    rx: Mailbox<RegionMessage>,
    region_by_shard: HashMap<ShardId, RegionRef>,
    regions: HashMap<RegionRef, HashSet<ShardId>>,
    shards: HashMap<ShardId, ShardRef>,
    handing_off: HashSet<ActorId>,
    buffers: HashMap<ShardId, VecDeque<Delivery>>,
    buffered_total: usize,
    members_by_age: BTreeSet<Member>,
    coordinator: Option<CoordinatorRef>,
    watched_regions: HashSet<ActorId>,
    timers: Vec<JoinHandle<()>>,
}

impl ShardRegion {
    pub(crate) fn new(path: String, options: RegionOptions) -> (RegionRef, Self) {
        let (self_ref, rx) = mailbox(path);
        let self_ref = RegionRef(self_ref);

        let region = Self {
            type_name: options.type_name,
            settings: options.settings,
            cluster: options.cluster,
            role: options.role,
            extractor: options.extractor,
            factory: options.factory,
            remember_entries: options.remember_entries,
            journal: options.journal,
            dead_letters: options.dead_letters,
            tasks: options.tasks,
            self_ref: self_ref.clone(),
            rx,
            region_by_shard: HashMap::new(),
            regions: HashMap::new(),
            shards: HashMap::new(),
            handing_off: HashSet::new(),
            buffers: HashMap::new(),
            buffered_total: 0,
            members_by_age: BTreeSet::new(),
            coordinator: None,
            watched_regions: HashSet::new(),
            timers: Vec::new(),
        };

        (self_ref, region)
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        info!("[Region {}] Running at {}", self.type_name, self.self_ref.path());

        // Subscribe before the snapshot so no membership change is lost;
        // duplicates fold into the same set.
        let mut events = self.cluster.subscribe();
        let forward_to = self.self_ref.clone();
        self.timers.push(spawn_named("region::membership", async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !forward_to.send_raw(RegionMessage::Cluster(event)) {
                            break;
                        }
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[Region] Membership stream lagged, skipped {} events", skipped);
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        for member in self.cluster.members() {
            if self.matches_role(&member) {
                self.members_by_age.insert(member);
            }
        }
        self.register();

        let retry = schedule_repeating(self.settings.retry_interval, &self.self_ref.0, || {
            RegionMessage::Retry
        });
        self.timers.push(retry);

        let result = self.run_loop().await;
        if let Err(why) = &result {
            error!("[Region {}] Stopping: {}", self.type_name, why);
        }

        for timer in self.timers.drain(..) {
            timer.abort();
        }

        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        while let Some(message) = self.rx.recv().await {
            match message {
                RegionMessage::Route { message, sender } => self.deliver_message(message, sender)?,
                RegionMessage::RegisterAck { coordinator } => self.register_ack(coordinator),
                RegionMessage::HostShard { shard } => self.host_shard(shard)?,
                RegionMessage::ShardHome { shard, region } => self.shard_home(shard, region)?,
                RegionMessage::BeginHandOff { shard, reply_to } => {
                    self.begin_hand_off(shard, reply_to);
                },
                RegionMessage::HandOff { shard, reply_to } => self.hand_off(shard, reply_to),
                RegionMessage::Cluster(event) => self.cluster_event(event),
                RegionMessage::Retry => self.retry(),
                RegionMessage::CoordinatorTerminated(coordinator) => {
                    self.coordinator_terminated(coordinator);
                },
                RegionMessage::RegionTerminated(region) => self.region_terminated(region),
                RegionMessage::ShardTerminated { shard, id } => self.shard_terminated(shard, id)?,
            }
        }

        Ok(())
    }

    fn matches_role(&self, member: &Member) -> bool {
        self.role.as_ref().map_or(true, |role| member.has_role(role))
    }

    /// Sends `Register` (or `RegisterProxy`) to wherever the coordinator
    /// singleton lives according to the current oldest member. Retried from
    /// the retry tick until `RegisterAck` arrives.
    fn register(&mut self) {
        let Some(oldest) = self.members_by_age.iter().next() else {
            debug!("[Region {}] No cluster members to register with", self.type_name);
            return;
        };

        let path = coordinator_singleton_path(
            oldest.address(),
            &self.settings.guardian_name,
            &self.type_name,
        );
        let Some(coordinator) = self.cluster.registry().lookup::<CoordinatorRef>(&path) else {
            debug!("[Region {}] Coordinator not yet available at {}", self.type_name, path);
            return;
        };

        debug!("[Region {}] Registering at {}", self.type_name, path);
        let message = if self.factory.is_some() {
            CoordinatorMessage::Register(self.self_ref.clone())
        } else {
            CoordinatorMessage::RegisterProxy(self.self_ref.clone())
        };
        coordinator.send(message);
    }

    fn register_ack(&mut self, coordinator: CoordinatorRef) {
        if self.coordinator.as_ref().map_or(true, |c| c.id() != coordinator.id()) {
            info!("[Region {}] Registered with coordinator {}", self.type_name, coordinator.path());
            watch(&coordinator, &self.self_ref.0, {
                let coordinator = coordinator.clone();
                move || RegionMessage::CoordinatorTerminated(coordinator)
            });
        }
        self.coordinator = Some(coordinator);

        self.request_buffered_homes();
    }

    fn request_buffered_homes(&mut self) {
        let buffered: Vec<ShardId> = self.buffers.keys().cloned().collect();
        for shard in buffered {
            self.request_shard_home(&shard);
        }
    }

    fn request_shard_home(&self, shard: &ShardId) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.send(CoordinatorMessage::GetShardHome {
                shard: shard.clone(),
                from: Some(self.self_ref.clone()),
            });
        }
    }

    fn retry(&mut self) {
        if self.coordinator.is_none() {
            self.register();
        } else {
            self.request_buffered_homes();
        }
    }

    fn cluster_event(&mut self, event: MemberEvent) {
        let previous_oldest = self.members_by_age.iter().next().cloned();

        match event {
            MemberEvent::MemberUp(member) => {
                if self.matches_role(&member) {
                    self.members_by_age.insert(member);
                }
            },
            MemberEvent::MemberRemoved(member) => {
                self.members_by_age.remove(&member);
            },
        }

        let oldest = self.members_by_age.iter().next().cloned();
        if oldest != previous_oldest {
            debug!(
                "[Region {}] Oldest member changed, re-resolving the coordinator",
                self.type_name
            );
            self.coordinator = None;
            self.register();
        }
    }

    /// Routes one application message, buffering it when the shard's home
    /// is unknown.
    fn deliver_message(&mut self, message: Message, sender: Option<Recipient>) -> Result<()> {
        let Some(entry_id) = self.extractor.entry_id(&message) else {
            self.dead_letters.publish("message not recognized by the extractor", message);
            return Ok(());
        };
        if entry_id.is_empty() {
            self.dead_letters.publish("empty entry id", message);
            return Ok(());
        }

        let shard = self.extractor.shard_id(&message);
        if shard.is_empty() {
            self.dead_letters.publish(format!("empty shard id for entry {entry_id}"), message);
            return Ok(());
        }

        match self.region_by_shard.get(&shard).cloned() {
            Some(region) if region == self.self_ref => {
                let shard_ref = self.get_or_create_shard(&shard)?;
                shard_ref.send(ShardMessage::Route { message, sender });
            },
            Some(region) => {
                region.send_raw(RegionMessage::Route { message, sender });
            },
            None => {
                if !self.buffers.contains_key(&shard) {
                    self.request_shard_home(&shard);
                }

                if self.buffered_total >= self.settings.buffer_size {
                    warn!(
                        "[Region {}] Buffer is full ({} messages), dropping message for shard {}",
                        self.type_name, self.buffered_total, shard
                    );
                    self.dead_letters
                        .publish(format!("buffer full, shard {shard} has no home yet"), message);
                } else {
                    self.buffers.entry(shard).or_default().push_back(Delivery { message, sender });
                    self.buffered_total += 1;
                }
            },
        }

        Ok(())
    }

    fn get_or_create_shard(&mut self, shard: &ShardId) -> Result<ShardRef> {
        if let Some(shard_ref) = self.shards.get(shard) {
            return Ok(shard_ref.clone());
        }

        let Some(factory) = self.factory.clone() else {
            return Err(Error::IllegalState(format!(
                "proxy-only region {} asked to host shard {shard}",
                self.self_ref.path()
            )));
        };

        info!("[Region {}] Starting shard {}", self.type_name, shard);
        let (shard_ref, shard_unit) = Shard::new(ShardOptions {
            type_name: self.type_name.clone(),
            shard_id: shard.clone(),
            path: format!("{}/{}", self.self_ref.path(), shard),
            settings: Arc::clone(&self.settings),
            extractor: Arc::clone(&self.extractor),
            factory,
            remember_entries: self.remember_entries,
            journal: Arc::clone(&self.journal),
            dead_letters: Arc::clone(&self.dead_letters),
            tasks: Arc::clone(&self.tasks),
        });

        let type_name = self.type_name.clone();
        let shard_id = shard.clone();
        self.tasks.track(spawn_named("shard::run", async move {
            if let Err(why) = shard_unit.run().await {
                error!("[Shard {}/{}] Stopped: {}", type_name, shard_id, why);
            }
        }));

        watch(&shard_ref, &self.self_ref.0, {
            let shard = shard.clone();
            let id = shard_ref.id();
            move || RegionMessage::ShardTerminated { shard, id }
        });

        self.shards.insert(shard.clone(), shard_ref.clone());
        Ok(shard_ref)
    }

    fn host_shard(&mut self, shard: ShardId) -> Result<()> {
        if self.factory.is_none() {
            return Err(Error::IllegalState(format!(
                "proxy-only region {} told to host shard {shard}",
                self.self_ref.path()
            )));
        }

        debug!("[Region {}] Hosting shard {}", self.type_name, shard);
        self.region_by_shard.insert(shard.clone(), self.self_ref.clone());
        self.regions.entry(self.self_ref.clone()).or_default().insert(shard.clone());
        self.get_or_create_shard(&shard)?;
        self.flush_buffer(&shard)?;

        match &self.coordinator {
            Some(coordinator) => {
                coordinator.send(CoordinatorMessage::ShardStarted { shard });
            },
            // The coordinator re-sends HostShard until acknowledged, so a
            // missing registration only delays the ack.
            None => debug!(
                "[Region {}] Hosting shard without a registered coordinator",
                self.type_name
            ),
        }

        Ok(())
    }

    fn shard_home(&mut self, shard: ShardId, region: RegionRef) -> Result<()> {
        debug!("[Region {}] Shard {} is at {}", self.type_name, shard, region.path());

        if let Some(previous) = self.region_by_shard.get(&shard).cloned() {
            if previous == self.self_ref && region != self.self_ref {
                return Err(Error::IllegalState(format!(
                    "shard {shard} moved from this region to {} without a handoff",
                    region.path()
                )));
            }
            if previous != region {
                if let Some(shards) = self.regions.get_mut(&previous) {
                    shards.remove(&shard);
                }
            }
        }

        self.region_by_shard.insert(shard.clone(), region.clone());
        self.regions.entry(region.clone()).or_default().insert(shard.clone());

        if region == self.self_ref {
            self.get_or_create_shard(&shard)?;
        } else if self.watched_regions.insert(region.id()) {
            watch(&region.0, &self.self_ref.0, {
                let region = region.clone();
                move || RegionMessage::RegionTerminated(region)
            });
        }

        self.flush_buffer(&shard)
    }

    fn flush_buffer(&mut self, shard: &ShardId) -> Result<()> {
        let Some(buffered) = self.buffers.remove(shard) else {
            return Ok(());
        };
        self.buffered_total -= buffered.len();
        if buffered.is_empty() {
            return Ok(());
        }

        debug!(
            "[Region {}] Delivering {} buffered messages for shard {}",
            self.type_name,
            buffered.len(),
            shard
        );

        match self.region_by_shard.get(shard).cloned() {
            Some(region) if region == self.self_ref => {
                let shard_ref = self.get_or_create_shard(shard)?;
                for Delivery { message, sender } in buffered {
                    shard_ref.send(ShardMessage::Route { message, sender });
                }
            },
            Some(region) => {
                for Delivery { message, sender } in buffered {
                    region.send_raw(RegionMessage::Route { message, sender });
                }
            },
            None => {
                // Flush without a home; keep the messages.
                self.buffered_total += buffered.len();
                self.buffers.insert(shard.clone(), buffered);
            },
        }

        Ok(())
    }

    fn begin_hand_off(&mut self, shard: ShardId, reply_to: WorkerRef) {
        debug!("[Region {}] BeginHandOff for shard {}", self.type_name, shard);

        if let Some(region) = self.region_by_shard.remove(&shard) {
            if let Some(shards) = self.regions.get_mut(&region) {
                shards.remove(&shard);
            }
        }

        reply_to.send(WorkerMessage::BeginHandOffAck {
            shard,
            from: self.self_ref.clone(),
        });
    }

    fn hand_off(&mut self, shard: ShardId, reply_to: WorkerRef) {
        if let Some(buffered) = self.buffers.remove(&shard) {
            self.buffered_total -= buffered.len();
            // These arrived between BeginHandOff and HandOff, possibly
            // forwarded by regions that had already dropped their mapping;
            // delivering them after the move could put them ahead of their
            // senders' earlier traffic.
            debug!(
                "[Region {}] Purging {} buffered messages for shard {} at handoff",
                self.type_name,
                buffered.len(),
                shard
            );
            for delivery in buffered {
                self.dead_letters.publish(format!("handoff of shard {shard}"), delivery.message);
            }
        }

        match self.shards.get(&shard) {
            Some(shard_ref) => {
                debug!("[Region {}] Handing off hosted shard {}", self.type_name, shard);
                self.handing_off.insert(shard_ref.id());
                shard_ref.send(ShardMessage::HandOff { shard, reply_to });
            },
            None => {
                debug!("[Region {}] HandOff for unhosted shard {}", self.type_name, shard);
                reply_to.send(WorkerMessage::ShardStopped { shard });
            },
        }
    }

    fn coordinator_terminated(&mut self, coordinator: CoordinatorRef) {
        if self.coordinator.as_ref().is_some_and(|c| c.id() == coordinator.id()) {
            info!("[Region {}] Coordinator terminated", self.type_name);
            self.coordinator = None;
        }
    }

    fn region_terminated(&mut self, region: RegionRef) {
        self.watched_regions.remove(&region.id());

        let Some(shards) = self.regions.remove(&region) else {
            return;
        };

        info!(
            "[Region {}] Region {} terminated, forgetting {} shards",
            self.type_name,
            region.path(),
            shards.len()
        );
        for shard in shards {
            if self.region_by_shard.get(&shard) == Some(&region) {
                self.region_by_shard.remove(&shard);
            }
        }
    }

    fn shard_terminated(&mut self, shard: ShardId, id: ActorId) -> Result<()> {
        if self.shards.get(&shard).map_or(true, |shard_ref| shard_ref.id() != id) {
            return Ok(());
        }
        self.shards.remove(&shard);

        if self.handing_off.remove(&id) {
            debug!("[Region {}] Shard {} handed off", self.type_name, shard);
            return Ok(());
        }

        Err(Error::IllegalState(format!("shard {shard} terminated outside of a handoff")))
    }
}
