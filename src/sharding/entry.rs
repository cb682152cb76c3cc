//! Entries: the application-defined stateful workers sharding routes to,
//! plus everything the application supplies to describe them (the message
//! extractor, the entry behavior and its factory).

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use super::messages::ShardMessage;
use super::EntryId;
use crate::actor::{mailbox, Ref, TaskSet};
use crate::internal::tokio::spawn_named;

/// An opaque application message.
///
/// Sharding never looks inside one other than through the application's
/// [`MessageExtractor`]; it is boxed because messages cross shard and
/// region boundaries that are unaware of the application's types.
pub type Message = Box<dyn Any + Send>;

/// A reply endpoint travelling with a routed message, preserving the sender
/// across every forwarding hop.
pub type Recipient = Ref<Message>;

/// Creates a reply endpoint and the receiving half to read replies from.
/// Mostly useful to callers outside the sharding fabric, such as tests.
pub fn recipient(path: impl Into<String>) -> (Recipient, crate::actor::Mailbox<Message>) {
    mailbox(path)
}

/// The default stop message: an entry receiving one stops without its
/// [`Entry::handle`] being invoked.
#[derive(Clone, Copy, Debug, Default)]
pub struct StopEntry;

/// A message together with its preserved sender, as delivered to an entry
/// and as held in the message buffers.
pub(crate) struct Delivery {
    pub message: Message,
    pub sender: Option<Recipient>,
}

pub(crate) type EntryRef = Ref<Delivery>;

/// Extracts routing information from application messages.
///
/// `entry_id` is a partial function: returning `None` marks the message as
/// unknown to this entry type and it goes to the dead-letter sink.
/// `shard_id` is consulted only after `entry_id` returned an id.
pub trait MessageExtractor: Send + Sync {
    /// The entry a message is addressed to, or `None` for messages this
    /// extractor does not recognize.
    fn entry_id(&self, message: &Message) -> Option<EntryId>;

    /// The shard the addressed entry belongs to.
    fn shard_id(&self, message: &Message) -> super::ShardId;

    /// Strips any routing envelope, returning what the entry itself should
    /// see. The default keeps the message as is.
    fn unwrap_message(&self, message: Message) -> Message {
        message
    }
}

/// The application-defined behavior of one entry.
#[async_trait]
pub trait Entry: Send {
    /// Handles one delivered message. Replies, if any, go through
    /// [`EntryContext::reply`].
    async fn handle(&mut self, message: Message, ctx: &mut EntryContext);
}

/// Produces fresh [`Entry`] instances; absent for proxy-only regions.
pub trait EntryFactory: Send + Sync {
    fn create(&self, entry_id: &EntryId) -> Box<dyn Entry>;
}

/// What an entry can see and do about its own hosting while handling a
/// message.
pub struct EntryContext {
    entry_id: EntryId,
    shard: Ref<ShardMessage>,
    sender: Option<Recipient>,
    stopping: bool,
}

impl EntryContext {
    pub fn entry_id(&self) -> &EntryId {
        &self.entry_id
    }

    /// The preserved sender of the message being handled, if any.
    pub fn sender(&self) -> Option<&Recipient> {
        self.sender.as_ref()
    }

    /// Replies to the preserved sender. Returns whether a sender was
    /// present and still alive.
    pub fn reply(&self, message: impl Any + Send) -> bool {
        match &self.sender {
            Some(sender) => sender.send(Box::new(message)),
            None => false,
        }
    }

    /// Requests graceful shutdown through the owning shard with the
    /// default [`StopEntry`] stop message. The shard diverts new messages
    /// into a buffer until the entry has stopped.
    pub fn passivate(&self) {
        self.passivate_with(StopEntry);
    }

    /// Same as [`Self::passivate`] with an application-defined stop
    /// message; the entry is expected to call [`Self::stop`] when handling
    /// it.
    pub fn passivate_with(&self, stop_message: impl Any + Send) {
        self.shard.send(ShardMessage::Passivate {
            entry: self.entry_id.clone(),
            stop_message: Box::new(stop_message),
        });
    }

    /// Stops the entry once the current `handle` call returns. Prefer
    /// [`Self::passivate`], which lets the shard divert in-flight messages
    /// instead of dead-lettering them at the mailbox.
    pub fn stop(&mut self) {
        self.stopping = true;
    }
}

/// Spawns the runner task for one entry and hands back its mailbox handle.
pub(crate) fn spawn_entry(
    path: String,
    shard: Ref<ShardMessage>,
    entry_id: EntryId,
    factory: &Arc<dyn EntryFactory>,
    tasks: &TaskSet,
) -> EntryRef {
    let (entry_ref, mut entry_mailbox) = mailbox::<Delivery>(path);
    let mut entry = factory.create(&entry_id);

    let handle = spawn_named("entry::run", async move {
        let mut ctx = EntryContext {
            entry_id,
            shard,
            sender: None,
            stopping: false,
        };

        while let Some(delivery) = entry_mailbox.recv().await {
            if delivery.message.as_ref().is::<StopEntry>() {
                break;
            }

            ctx.sender = delivery.sender;
            entry.handle(delivery.message, &mut ctx).await;
            ctx.sender = None;

            if ctx.stopping {
                break;
            }
        }
    });
    tasks.track(handle);

    entry_ref
}

/// A message dropped by the sharding fabric, together with the reason.
pub struct DeadLetter {
    pub reason: String,
    pub message: Message,
}

impl fmt::Debug for DeadLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetter").field("reason", &self.reason).finish()
    }
}

/// The sink unroutable and overflowing messages are dropped to.
///
/// Drops are counted and logged; a subscriber installed with
/// [`DeadLetters::subscribe`] additionally receives the dropped messages
/// themselves.
#[derive(Default)]
pub struct DeadLetters {
    dropped: AtomicU64,
    sink: parking_lot::Mutex<Option<UnboundedSender<DeadLetter>>>,
}

impl DeadLetters {
    pub fn count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Installs a subscriber, replacing any previous one.
    pub fn subscribe(&self) -> UnboundedReceiver<DeadLetter> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sink.lock() = Some(tx);
        rx
    }

    pub(crate) fn publish(&self, reason: impl Into<String>, message: Message) {
        let reason = reason.into();
        warn!("[DeadLetters] Dropping message: {}", reason);
        self.dropped.fetch_add(1, Ordering::SeqCst);

        if let Some(sink) = &*self.sink.lock() {
            drop(sink.send(DeadLetter { reason, message }));
        }
    }
}

impl fmt::Debug for DeadLetters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetters").field("dropped", &self.count()).finish()
    }
}
