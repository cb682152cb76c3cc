//! Lightweight mailbox plumbing shared by every sharding unit.
//!
//! A unit in this library is a spawned task looping over a private FIFO
//! mailbox, so state inside a unit needs no locks. The pieces here are the
//! unit's address ([`Ref`]), its receiving half ([`Mailbox`]), death watch
//! built on mailbox closure, one-shot and repeating timers, and a typed
//! [`PathRegistry`] standing in for selection by logical path.
//!
//! Refs are keyed handles: they compare by a generation-tagged [`ActorId`],
//! never by path, so a handle to a restarted unit under the same path is a
//! different ref.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::internal::tokio::spawn_named;

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a spawned unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    fn next() -> Self {
        ActorId(NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A cloneable handle to a unit's mailbox.
pub struct Ref<M> {
    id: ActorId,
    path: Arc<str>,
    tx: UnboundedSender<M>,
}

impl<M> Ref<M> {
    /// Enqueues a message, returning whether the receiving unit was still
    /// alive. Messages to stopped units are silently discarded, exactly as
    /// a remote send to a dead endpoint would be.
    pub fn send(&self, message: M) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Like [`Self::send`], but hands the message back when the unit has
    /// stopped, so the caller can park it instead of losing it.
    pub(crate) fn send_or_return(&self, message: M) -> Result<(), M> {
        self.tx.send(message).map_err(|err| err.0)
    }

    /// Resolves once the unit behind this handle has stopped. This is the
    /// primitive death watch is built on.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<M> Clone for Ref<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            path: Arc::clone(&self.path),
            tx: self.tx.clone(),
        }
    }
}

impl<M> PartialEq for Ref<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<M> Eq for Ref<M> {}

impl<M> Hash for Ref<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<M> fmt::Debug for Ref<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({}#{})", self.path, self.id)
    }
}

/// The receiving half of a unit's mailbox.
pub struct Mailbox<M> {
    rx: UnboundedReceiver<M>,
}

impl<M> Mailbox<M> {
    /// Receives the next message, or `None` once every [`Ref`] to this
    /// mailbox has been dropped.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }
}

/// Creates a fresh mailbox and its address.
pub fn mailbox<M>(path: impl Into<String>) -> (Ref<M>, Mailbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let path: String = path.into();

    let actor_ref = Ref {
        id: ActorId::next(),
        path: Arc::from(path.as_str()),
        tx,
    };

    (actor_ref, Mailbox { rx })
}

/// Watches `subject` and delivers `notification()` to `watcher` when it
/// stops.
///
/// Notifications can arrive after the watcher has moved on (the subject may
/// even have been replaced under the same path), so every handler receiving
/// one must tolerate stale terminations, typically by comparing the
/// [`ActorId`] captured in the notification against its current state.
pub fn watch<S, M>(
    subject: &Ref<S>,
    watcher: &Ref<M>,
    notification: impl FnOnce() -> M + Send + 'static,
) -> JoinHandle<()>
where
    S: Send + 'static,
    M: Send + 'static,
{
    let subject = subject.clone();
    let watcher = watcher.clone();

    spawn_named("actor::watch", async move {
        subject.closed().await;
        watcher.send(notification());
    })
}

/// Delivers `message` to `target` after `delay`, unless aborted first.
pub fn schedule_once<M>(delay: Duration, target: &Ref<M>, message: M) -> JoinHandle<()>
where
    M: Send + 'static,
{
    let target = target.clone();

    spawn_named("actor::schedule_once", async move {
        tokio::time::sleep(delay).await;
        target.send(message);
    })
}

/// Delivers `message()` to `target` every `interval` until the target stops
/// or the returned handle is aborted.
pub fn schedule_repeating<M>(
    interval: Duration,
    target: &Ref<M>,
    mut message: impl FnMut() -> M + Send + 'static,
) -> JoinHandle<()>
where
    M: Send + 'static,
{
    let target = target.clone();

    spawn_named("actor::schedule_repeating", async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of `interval` completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if !target.send(message()) {
                break;
            }
        }
    })
}

/// Typed lookup of handles by logical path: the transport's
/// selection-by-path primitive, shared by every node of an in-process
/// cluster.
#[derive(Default)]
pub struct PathRegistry {
    entries: DashMap<String, Box<dyn Any + Send + Sync>>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under `path`, replacing any previous registration.
    pub fn register<T>(&self, path: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.entries.insert(path.into(), Box::new(value));
    }

    pub fn deregister(&self, path: &str) {
        self.entries.remove(path);
    }

    /// Resolves `path` to a handle of type `T`. Returns `None` when nothing
    /// is registered there, or when the registration has a different type.
    pub fn lookup<T>(&self, path: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.entries
            .get(path)
            .and_then(|entry| entry.value().downcast_ref::<T>().cloned())
    }
}

impl fmt::Debug for PathRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathRegistry").field("len", &self.entries.len()).finish()
    }
}

/// Tracks the tasks spawned on behalf of one node so that terminating the
/// node can abort all of them, shards and entries included.
#[derive(Default)]
pub(crate) struct TaskSet {
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        // Opportunistically drop completed tasks so long-lived nodes do not
        // accumulate handles.
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub(crate) fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refs_compare_by_identity_not_path() {
        let (a, _mailbox_a) = mailbox::<u8>("node-1/user/sharding/counters");
        let (b, _mailbox_b) = mailbox::<u8>("node-1/user/sharding/counters");

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.path(), b.path());
    }

    #[tokio::test]
    async fn closed_resolves_when_mailbox_dropped() {
        let (r, mailbox) = mailbox::<u8>("subject");
        drop(mailbox);

        tokio::time::timeout(Duration::from_secs(1), r.closed())
            .await
            .expect("closed should resolve");
        assert!(!r.send(1));
    }

    #[tokio::test]
    async fn watch_notifies_watcher() {
        let (subject, subject_mailbox) = mailbox::<u8>("subject");
        let (watcher, mut watcher_mailbox) = mailbox::<&'static str>("watcher");

        watch(&subject, &watcher, || "terminated");
        drop(subject_mailbox);

        let notification = tokio::time::timeout(Duration::from_secs(1), watcher_mailbox.recv())
            .await
            .expect("notification should arrive");
        assert_eq!(notification, Some("terminated"));
    }

    #[tokio::test]
    async fn registry_lookup_is_typed() {
        let registry = PathRegistry::new();
        let (r, _mailbox) = mailbox::<u8>("node-1/user/sharding/counters");

        registry.register("node-1/user/sharding/counters", r.clone());

        let found: Option<Ref<u8>> = registry.lookup("node-1/user/sharding/counters");
        assert_eq!(found, Some(r));

        let wrong_type: Option<Ref<u16>> = registry.lookup("node-1/user/sharding/counters");
        assert!(wrong_type.is_none());
        assert!(registry.lookup::<Ref<u8>>("node-2/user/sharding/counters").is_none());
    }
}
