//! The journal collaborator: an append-only event log with snapshots.
//!
//! Event-sourced units (the coordinator, and shards that remember their
//! entries) write their domain events here and rebuild state by replaying
//! them on recovery. Payloads are opaque bytes to the journal; the units
//! encode them with serde through [`EventSourced`].
//!
//! [`InMemoryJournal`] is the bundled implementation: it backs the test
//! suites and single-process deployments, and doubles as the reference for
//! writing a durable one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::internal::prelude::*;

/// One persisted event.
#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// A state snapshot, valid up to and including `sequence`.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Which snapshot to offer on recovery.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotSelectionCriteria {
    /// Upper bound on the snapshot's sequence number, inclusive.
    pub max_sequence: u64,
}

impl SnapshotSelectionCriteria {
    /// The newest available snapshot.
    pub fn latest() -> Self {
        Self { max_sequence: u64::MAX }
    }
}

impl Default for SnapshotSelectionCriteria {
    fn default() -> Self {
        Self::latest()
    }
}

/// Append-only log keyed by persistence id.
///
/// `append` either durably stores the payload and returns its sequence
/// number, or fails; on failure the write may or may not have reached the
/// log, which is why event-sourced units recover from the log rather than
/// assume either outcome.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, persistence_id: &str, payload: Vec<u8>) -> Result<u64>;

    /// Loads all entries with `sequence >= from_sequence`, in order.
    async fn load(&self, persistence_id: &str, from_sequence: u64) -> Result<Vec<JournalEntry>>;

    async fn save_snapshot(&self, persistence_id: &str, snapshot: Snapshot) -> Result<()>;

    async fn load_snapshot(
        &self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<Option<Snapshot>>;
}

#[derive(Default)]
struct Stream {
    entries: Vec<JournalEntry>,
    snapshots: Vec<Snapshot>,
}

/// A [`Journal`] held entirely in memory.
///
/// Shared between the nodes of an in-process cluster it stands in for a
/// replicated store, which is what makes coordinator failover observable in
/// tests. `fail_next_appends` injects write failures to exercise the
/// persistence-failure paths.
#[derive(Default)]
pub struct InMemoryJournal {
    streams: DashMap<String, parking_lot::Mutex<Stream>>,
    failing_appends: AtomicU64,
}

impl InMemoryJournal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `n` appends fail, across all persistence ids.
    pub fn fail_next_appends(&self, n: u64) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// All entries persisted for `persistence_id`, for inspection.
    pub fn entries(&self, persistence_id: &str) -> Vec<JournalEntry> {
        self.streams
            .get(persistence_id)
            .map(|stream| stream.lock().entries.clone())
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(&self, persistence_id: &str, payload: Vec<u8>) -> Result<u64> {
        if self.take_injected_failure() {
            return Err(Error::Journal(format!("injected append failure for {persistence_id}")));
        }

        let stream = self.streams.entry(persistence_id.to_owned()).or_default();
        let mut stream = stream.lock();
        let sequence = stream.entries.last().map_or(1, |entry| entry.sequence + 1);
        stream.entries.push(JournalEntry { sequence, payload });

        Ok(sequence)
    }

    async fn load(&self, persistence_id: &str, from_sequence: u64) -> Result<Vec<JournalEntry>> {
        let entries = self
            .streams
            .get(persistence_id)
            .map(|stream| {
                stream
                    .lock()
                    .entries
                    .iter()
                    .filter(|entry| entry.sequence >= from_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(entries)
    }

    async fn save_snapshot(&self, persistence_id: &str, snapshot: Snapshot) -> Result<()> {
        let stream = self.streams.entry(persistence_id.to_owned()).or_default();
        stream.lock().snapshots.push(snapshot);

        Ok(())
    }

    async fn load_snapshot(
        &self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<Option<Snapshot>> {
        let snapshot = self.streams.get(persistence_id).and_then(|stream| {
            stream
                .lock()
                .snapshots
                .iter()
                .filter(|snapshot| snapshot.sequence <= criteria.max_sequence)
                .last()
                .cloned()
        });

        Ok(snapshot)
    }
}

/// The typed face of one persistence id: owns the journal handle, the id
/// and the highest sequence number seen, and encodes events and snapshots
/// with serde.
pub struct EventSourced {
    journal: Arc<dyn Journal>,
    persistence_id: String,
    last_sequence: u64,
}

impl EventSourced {
    pub fn new(journal: Arc<dyn Journal>, persistence_id: impl Into<String>) -> Self {
        Self {
            journal,
            persistence_id: persistence_id.into(),
            last_sequence: 0,
        }
    }

    pub fn persistence_id(&self) -> &str {
        &self.persistence_id
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Appends one event.
    pub async fn persist<E: Serialize>(&mut self, event: &E) -> Result<u64> {
        let payload = serde_json::to_vec(event)?;
        let sequence = self.journal.append(&self.persistence_id, payload).await?;
        self.last_sequence = sequence;

        Ok(sequence)
    }

    /// Rebuilds state: applies the newest snapshot if one exists, then
    /// folds every event persisted after it.
    pub async fn recover<S, E>(&mut self, initial: S, mut fold: impl FnMut(S, E) -> S) -> Result<S>
    where
        S: DeserializeOwned,
        E: DeserializeOwned,
    {
        let mut state = initial;
        let mut from_sequence = 0;

        let snapshot = self
            .journal
            .load_snapshot(&self.persistence_id, SnapshotSelectionCriteria::latest())
            .await?;
        if let Some(snapshot) = snapshot {
            state = serde_json::from_slice(&snapshot.payload)?;
            from_sequence = snapshot.sequence + 1;
            self.last_sequence = snapshot.sequence;
        }

        for entry in self.journal.load(&self.persistence_id, from_sequence).await? {
            let event: E = serde_json::from_slice(&entry.payload)?;
            state = fold(state, event);
            self.last_sequence = entry.sequence;
        }

        Ok(state)
    }

    /// Stores a snapshot covering everything persisted so far.
    pub async fn save_snapshot<S: Serialize>(&self, state: &S) -> Result<()> {
        let snapshot = Snapshot {
            sequence: self.last_sequence,
            payload: serde_json::to_vec(state)?,
        };

        self.journal.save_snapshot(&self.persistence_id, snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[tokio::test]
    async fn append_assigns_increasing_sequences() {
        let journal = InMemoryJournal::new();

        assert_eq!(journal.append("pid", b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(journal.append("pid", b"b".to_vec()).await.unwrap(), 2);
        assert_eq!(journal.append("other", b"c".to_vec()).await.unwrap(), 1);

        let loaded = journal.load("pid", 2).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].payload, b"b");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let journal = InMemoryJournal::new();
        journal.fail_next_appends(1);

        assert!(journal.append("pid", b"a".to_vec()).await.is_err());
        assert!(journal.append("pid", b"b".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_then_replay_equals_full_replay() {
        let journal = InMemoryJournal::new();
        let fold = |mut set: BTreeSet<String>, event: String| {
            set.insert(event);
            set
        };

        let mut sourced = EventSourced::new(journal.clone(), "pid");
        sourced.persist(&"one".to_owned()).await.unwrap();
        sourced.persist(&"two".to_owned()).await.unwrap();
        sourced.save_snapshot(&BTreeSet::from(["one".to_owned(), "two".to_owned()])).await.unwrap();
        sourced.persist(&"three".to_owned()).await.unwrap();

        let mut snapshotting = EventSourced::new(journal.clone(), "pid");
        let with_snapshot = snapshotting.recover(BTreeSet::new(), fold).await.unwrap();

        // Replaying the raw log must produce the same state.
        let mut full = BTreeSet::new();
        for entry in journal.entries("pid") {
            full = fold(full, serde_json::from_slice(&entry.payload).unwrap());
        }

        assert_eq!(with_snapshot, full);
        assert_eq!(snapshotting.last_sequence(), 3);
    }
}
