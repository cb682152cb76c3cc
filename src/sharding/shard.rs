//! A shard: the supervisor owning the entries of one (entry type, shard id)
//! pair on one node.
//!
//! The shard creates entries on demand, buffers messages for entries that
//! are starting or passivating, persists the entry set when the type
//! remembers its entries, and executes handoff when the coordinator moves
//! the shard elsewhere.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{
    spawn_entry,
    DeadLetters,
    Delivery,
    EntryFactory,
    EntryRef,
    Message,
    MessageExtractor,
    Recipient,
    StopEntry,
};
use super::handoff::spawn_handoff_stopper;
use super::messages::{ShardMessage, ShardRef, WorkerMessage, WorkerRef};
use super::settings::ShardingSettings;
use super::{EntryId, ShardId};
use crate::actor::{mailbox, schedule_once, schedule_repeating, watch, ActorId, Mailbox, TaskSet};
use crate::internal::prelude::*;
use crate::persistence::{EventSourced, Journal};

/// The entry-membership events of a remembering shard's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum EntryEvent {
    EntryStarted { entry: EntryId },
    EntryStopped { entry: EntryId },
}

impl EntryEvent {
    fn entry(&self) -> &EntryId {
        match self {
            EntryEvent::EntryStarted { entry } | EntryEvent::EntryStopped { entry } => entry,
        }
    }
}

pub(crate) struct ShardOptions {
    pub type_name: String,
    pub shard_id: ShardId,
    pub path: String,
    pub settings: Arc<ShardingSettings>,
    pub extractor: Arc<dyn MessageExtractor>,
    pub factory: Arc<dyn EntryFactory>,
    pub remember_entries: bool,
    pub journal: Arc<dyn Journal>,
    pub dead_letters: Arc<DeadLetters>,
    pub tasks: Arc<TaskSet>,
}

pub(crate) struct Shard {
    type_name: String,
    shard_id: ShardId,
    path: String,
    settings: Arc<ShardingSettings>,
    extractor: Arc<dyn MessageExtractor>,
    factory: Arc<dyn EntryFactory>,
    remember_entries: bool,
    journal: EventSourced,
    dead_letters: Arc<DeadLetters>,
    tasks: Arc<TaskSet>,
    self_ref: ShardRef,
    rx: Mailbox<ShardMessage>,
    /// The persisted entry set; only maintained when remembering.
    remembered: BTreeSet<EntryId>,
    entries: HashMap<EntryId, EntryRef>,
    passivating: HashSet<EntryId>,
    /// Per-entry buffers, installed while an entry is starting,
    /// passivating, or blocked on a failed persistence write.
    buffers: HashMap<EntryId, VecDeque<Delivery>>,
    buffered_total: usize,
    handing_off: bool,
    timers: Vec<JoinHandle<()>>,
}

impl Shard {
    pub(crate) fn new(options: ShardOptions) -> (ShardRef, Self) {
        let (self_ref, rx) = mailbox(options.path.clone());
        let persistence_id = format!("/sharding/{}Shard/{}", options.type_name, options.shard_id);

        let shard = Self {
            type_name: options.type_name,
            shard_id: options.shard_id,
            path: options.path,
            settings: options.settings,
            extractor: options.extractor,
            factory: options.factory,
            remember_entries: options.remember_entries,
            journal: EventSourced::new(options.journal, persistence_id),
            dead_letters: options.dead_letters,
            tasks: options.tasks,
            self_ref: self_ref.clone(),
            rx,
            remembered: BTreeSet::new(),
            entries: HashMap::new(),
            passivating: HashSet::new(),
            buffers: HashMap::new(),
            buffered_total: 0,
            handing_off: false,
            timers: Vec::new(),
        };

        (self_ref, shard)
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        if self.remember_entries {
            self.recover().await?;

            let tick = schedule_repeating(self.settings.snapshot_interval, &self.self_ref, || {
                ShardMessage::SnapshotTick
            });
            self.timers.push(tick);
        }

        let result = self.run_loop().await;
        self.cleanup();

        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        while let Some(message) = self.rx.recv().await {
            if !self.handle(message).await? {
                break;
            }
        }

        Ok(())
    }

    /// Handles one message; `Ok(false)` stops the shard.
    async fn handle(&mut self, message: ShardMessage) -> Result<bool> {
        match message {
            ShardMessage::Route { message, sender } => self.route(message, sender).await,
            ShardMessage::Passivate {
                entry,
                stop_message,
            } => self.passivate(entry, stop_message),
            ShardMessage::HandOff { shard, reply_to } => return Ok(self.hand_off(shard, reply_to)),
            ShardMessage::EntryTerminated { entry, id } => {
                return self.entry_terminated(entry, id).await;
            },
            ShardMessage::RestartEntry { entry } => self.restart_entry(entry),
            ShardMessage::RetryPersistence { change } => self.retry_persistence(change).await,
            ShardMessage::SnapshotTick => self.snapshot().await,
        }

        Ok(true)
    }

    /// Replays the entry-membership log and materializes every remembered
    /// entry as a live child.
    async fn recover(&mut self) -> Result<()> {
        self.remembered = self
            .journal
            .recover(BTreeSet::new(), |mut entries: BTreeSet<EntryId>, event: EntryEvent| {
                match event {
                    EntryEvent::EntryStarted { entry } => {
                        entries.insert(entry);
                    },
                    EntryEvent::EntryStopped { entry } => {
                        entries.remove(&entry);
                    },
                }
                entries
            })
            .await?;

        if !self.remembered.is_empty() {
            info!(
                "[Shard {}/{}] Recovered {} remembered entries",
                self.type_name,
                self.shard_id,
                self.remembered.len()
            );
        }

        for entry_id in self.remembered.clone() {
            self.start_entry(entry_id);
        }

        Ok(())
    }

    async fn route(&mut self, message: Message, sender: Option<Recipient>) {
        if self.handing_off {
            self.dead_letters
                .publish(format!("shard {} is handing off", self.shard_id), message);
            return;
        }

        let Some(entry_id) = self.extractor.entry_id(&message) else {
            self.dead_letters.publish("message not recognized by the extractor", message);
            return;
        };
        if entry_id.is_empty() {
            self.dead_letters.publish("empty entry id", message);
            return;
        }

        let delivery = Delivery {
            message: self.extractor.unwrap_message(message),
            sender,
        };

        if self.buffers.contains_key(&entry_id) {
            self.buffer(entry_id, delivery);
        } else if self.entries.contains_key(&entry_id) {
            self.deliver(&entry_id, delivery);
        } else if self.remember_entries && !self.remembered.contains(&entry_id) {
            // First message for an unknown entry: the membership change has
            // to reach the log before the entry may run.
            self.buffers.insert(entry_id.clone(), VecDeque::new());
            self.buffer(entry_id.clone(), delivery);
            self.persist_started(entry_id).await;
        } else {
            self.start_entry(entry_id.clone());
            self.deliver(&entry_id, delivery);
        }
    }

    fn buffer(&mut self, entry_id: EntryId, delivery: Delivery) {
        if self.buffered_total >= self.settings.buffer_size {
            self.dead_letters.publish(
                format!("buffer for shard {} is full", self.shard_id),
                delivery.message,
            );
            return;
        }

        self.buffers.entry(entry_id).or_default().push_back(delivery);
        self.buffered_total += 1;
    }

    fn deliver(&mut self, entry_id: &EntryId, delivery: Delivery) {
        let Some(entry) = self.entries.get(entry_id).cloned() else {
            self.buffer(entry_id.clone(), delivery);
            return;
        };

        if let Err(delivery) = entry.send_or_return(delivery) {
            // The entry stopped but its termination is still queued; park
            // the message for the restart path.
            self.buffer(entry_id.clone(), delivery);
        }
    }

    fn drain_buffer(&mut self, entry_id: &EntryId) {
        if let Some(buffered) = self.buffers.remove(entry_id) {
            self.buffered_total -= buffered.len();

            for delivery in buffered {
                self.deliver(entry_id, delivery);
            }
        }
    }

    fn start_entry(&mut self, entry_id: EntryId) {
        debug!("[Shard {}/{}] Starting entry {}", self.type_name, self.shard_id, entry_id);

        let path = format!("{}/{}", self.path, entry_id);
        let entry = spawn_entry(path, self.self_ref.clone(), entry_id.clone(), &self.factory, &self.tasks);
        let id = entry.id();

        watch(&entry, &self.self_ref, {
            let entry = entry_id.clone();
            move || ShardMessage::EntryTerminated { entry, id }
        });
        self.entries.insert(entry_id, entry);
    }

    fn passivate(&mut self, entry_id: EntryId, stop_message: Message) {
        if self.handing_off || self.passivating.contains(&entry_id) {
            debug!(
                "[Shard {}/{}] Ignoring passivate for {}",
                self.type_name, self.shard_id, entry_id
            );
            return;
        }
        if self.buffers.contains_key(&entry_id) {
            debug!(
                "[Shard {}/{}] Entry {} is starting or blocked, ignoring passivate",
                self.type_name, self.shard_id, entry_id
            );
            return;
        }
        let Some(entry) = self.entries.get(&entry_id).cloned() else {
            debug!(
                "[Shard {}/{}] Passivate for unknown entry {}",
                self.type_name, self.shard_id, entry_id
            );
            return;
        };

        debug!("[Shard {}/{}] Passivating entry {}", self.type_name, self.shard_id, entry_id);
        self.passivating.insert(entry_id.clone());
        // Divert new messages while the entry drains.
        self.buffers.insert(entry_id, VecDeque::new());
        entry.send(Delivery {
            message: stop_message,
            sender: None,
        });
    }

    /// `false` when the shard should stop right away (no entries to wait
    /// for).
    fn hand_off(&mut self, shard: ShardId, reply_to: WorkerRef) -> bool {
        if self.handing_off {
            warn!(
                "[Shard {}/{}] HandOff received while already handing off, ignoring",
                self.type_name, self.shard_id
            );
            return true;
        }

        info!(
            "[Shard {}/{}] Handing off, stopping {} entries",
            self.type_name,
            self.shard_id,
            self.entries.len()
        );

        if self.entries.is_empty() {
            reply_to.send(WorkerMessage::ShardStopped { shard });
            return false;
        }

        self.handing_off = true;
        spawn_handoff_stopper(shard, reply_to, self.entries.values().cloned().collect(), &self.tasks);

        true
    }

    async fn entry_terminated(&mut self, entry_id: EntryId, id: ActorId) -> Result<bool> {
        if self.entries.get(&entry_id).map_or(true, |entry| entry.id() != id) {
            // A stale notification for a previous incarnation.
            return Ok(true);
        }
        self.entries.remove(&entry_id);

        if self.handing_off {
            self.passivating.remove(&entry_id);

            if self.entries.is_empty() {
                debug!("[Shard {}/{}] Handoff complete", self.type_name, self.shard_id);
                return Ok(false);
            }
            return Ok(true);
        }

        if self.passivating.remove(&entry_id) {
            let buffered = self.buffers.remove(&entry_id).unwrap_or_default();
            self.buffered_total -= buffered.len();

            if buffered.is_empty() {
                if self.remember_entries {
                    self.persist_stopped(entry_id).await;
                }
            } else {
                // Messages raced the passivation: bring the entry straight
                // back and drain them. No `EntryStopped` is persisted, the
                // entry never reached a stopped state as far as the log is
                // concerned.
                debug!(
                    "[Shard {}/{}] Entry {} got {} messages while passivating, restarting it",
                    self.type_name,
                    self.shard_id,
                    entry_id,
                    buffered.len()
                );
                self.start_entry(entry_id.clone());
                for delivery in buffered {
                    self.deliver(&entry_id, delivery);
                }
            }

            return Ok(true);
        }

        // Stopped without passivating.
        if self.remember_entries && self.remembered.contains(&entry_id) {
            debug!(
                "[Shard {}/{}] Entry {} stopped unexpectedly, restarting after backoff",
                self.type_name, self.shard_id, entry_id
            );
            self.track_timer(schedule_once(
                self.settings.entry_restart_backoff,
                &self.self_ref,
                ShardMessage::RestartEntry { entry: entry_id },
            ));
        } else {
            let buffered = self.buffers.remove(&entry_id).unwrap_or_default();
            self.buffered_total -= buffered.len();

            if !buffered.is_empty() {
                self.start_entry(entry_id.clone());
                for delivery in buffered {
                    self.deliver(&entry_id, delivery);
                }
            }
        }

        Ok(true)
    }

    fn restart_entry(&mut self, entry_id: EntryId) {
        if self.handing_off || self.entries.contains_key(&entry_id) {
            return;
        }

        if self.remember_entries && self.remembered.contains(&entry_id) {
            info!("[Shard {}/{}] Restarting entry {}", self.type_name, self.shard_id, entry_id);
            self.start_entry(entry_id.clone());
            self.drain_buffer(&entry_id);
        }
    }

    async fn persist_started(&mut self, entry_id: EntryId) {
        let event = EntryEvent::EntryStarted {
            entry: entry_id.clone(),
        };

        match self.journal.persist(&event).await {
            Ok(_) => {
                self.remembered.insert(entry_id.clone());
                if !self.entries.contains_key(&entry_id) {
                    self.start_entry(entry_id.clone());
                }
                self.drain_buffer(&entry_id);
            },
            Err(why) => self.persist_failed(event, &why),
        }
    }

    async fn persist_stopped(&mut self, entry_id: EntryId) {
        let event = EntryEvent::EntryStopped {
            entry: entry_id.clone(),
        };

        match self.journal.persist(&event).await {
            Ok(_) => {
                self.remembered.remove(&entry_id);
            },
            Err(why) => self.persist_failed(event, &why),
        }
    }

    /// Installs an empty buffer for the entry, blocking deliveries, and
    /// schedules a retry of the failed state change.
    fn persist_failed(&mut self, change: EntryEvent, why: &Error) {
        warn!(
            "[Shard {}/{}] Persisting {:?} failed, retrying after backoff: {}",
            self.type_name, self.shard_id, change, why
        );

        self.buffers.entry(change.entry().clone()).or_default();
        self.track_timer(schedule_once(
            self.settings.shard_failure_backoff,
            &self.self_ref,
            ShardMessage::RetryPersistence { change },
        ));
    }

    async fn retry_persistence(&mut self, change: EntryEvent) {
        match change {
            EntryEvent::EntryStarted { entry } => self.persist_started(entry).await,
            EntryEvent::EntryStopped { entry } => {
                let has_waiting = self.buffers.get(&entry).is_some_and(|b| !b.is_empty());

                if has_waiting {
                    // Messages arrived while the stop was blocked on the
                    // log. The stop was never recorded, so revive the entry
                    // instead of recording it now.
                    self.start_entry(entry.clone());
                    self.drain_buffer(&entry);
                } else {
                    self.buffers.remove(&entry);
                    self.persist_stopped(entry).await;
                }
            },
        }
    }

    async fn snapshot(&mut self) {
        if !self.remember_entries {
            return;
        }

        debug!("[Shard {}/{}] Saving snapshot", self.type_name, self.shard_id);

        if let Err(why) = self.journal.save_snapshot(&self.remembered).await {
            warn!("[Shard {}/{}] Saving snapshot failed: {}", self.type_name, self.shard_id, why);
        }
    }

    fn track_timer(&mut self, timer: JoinHandle<()>) {
        self.timers.retain(|t| !t.is_finished());
        self.timers.push(timer);
    }

    fn cleanup(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }

        for (_, entry) in self.entries.drain() {
            entry.send(Delivery {
                message: Box::new(StopEntry),
                sender: None,
            });
        }

        for (_, buffered) in self.buffers.drain() {
            for delivery in buffered {
                self.dead_letters.publish(
                    format!("shard {} stopped with messages buffered", self.shard_id),
                    delivery.message,
                );
            }
        }
        self.buffered_total = 0;
    }
}
