//! Shared harness for the sharding integration tests: a multi-node
//! in-process cluster, a recording test entry, and a handful of waiting and
//! journal-inspection helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use shoal::persistence::InMemoryJournal;
use shoal::prelude::*;

/// An application message explicitly naming its shard and entry, so tests
/// control placement precisely.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub shard: String,
    pub entry: String,
    pub body: String,
}

impl Envelope {
    pub fn new(shard: &str, entry: &str, body: &str) -> Self {
        Self {
            shard: shard.to_owned(),
            entry: entry.to_owned(),
            body: body.to_owned(),
        }
    }
}

pub struct EnvelopeExtractor;

impl MessageExtractor for EnvelopeExtractor {
    fn entry_id(&self, message: &Message) -> Option<EntryId> {
        message.downcast_ref::<Envelope>().map(|envelope| EntryId::from(envelope.entry.as_str()))
    }

    fn shard_id(&self, message: &Message) -> ShardId {
        message
            .downcast_ref::<Envelope>()
            .map(|envelope| ShardId::from(envelope.shard.as_str()))
            .unwrap_or_else(|| ShardId::from(""))
    }
}

/// One observation made by a recording entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seen {
    /// Address of the node the entry ran on.
    pub node: String,
    pub entry: String,
    pub body: String,
}

/// Emitted by the factory whenever an entry instance is created; lets tests
/// observe restarts and remembered-entry recovery.
pub const CREATED: &str = "__created";

pub struct RecordingFactory {
    node: String,
    seen: UnboundedSender<Seen>,
}

impl RecordingFactory {
    pub fn new(node: &str, seen: UnboundedSender<Seen>) -> Arc<Self> {
        Arc::new(Self {
            node: node.to_owned(),
            seen,
        })
    }
}

impl EntryFactory for RecordingFactory {
    fn create(&self, entry_id: &EntryId) -> Box<dyn Entry> {
        drop(self.seen.send(Seen {
            node: self.node.clone(),
            entry: entry_id.as_str().to_owned(),
            body: CREATED.to_owned(),
        }));

        Box::new(RecordingEntry {
            node: self.node.clone(),
            seen: self.seen.clone(),
        })
    }
}

/// The test entry. Bodies with special meaning:
///
/// * `"passivate"` asks the shard for graceful passivation,
/// * `"passivate-slow"` passivates with a custom stop message the entry
///   takes 300ms to act on,
/// * `"stop"` stops the entry abruptly, without passivating,
/// * `"hang"` blocks the entry's mailbox for a minute,
/// * anything else is recorded and echoed to the preserved sender.
pub struct RecordingEntry {
    node: String,
    seen: UnboundedSender<Seen>,
}

#[async_trait::async_trait]
impl Entry for RecordingEntry {
    async fn handle(&mut self, message: Message, ctx: &mut EntryContext) {
        let Ok(envelope) = message.downcast::<Envelope>() else {
            // A custom stop message from passivate-slow.
            tokio::time::sleep(Duration::from_millis(300)).await;
            ctx.stop();
            return;
        };

        match envelope.body.as_str() {
            "passivate" => ctx.passivate(),
            "passivate-slow" => ctx.passivate_with(SlowStop),
            "stop" => ctx.stop(),
            "hang" => tokio::time::sleep(Duration::from_secs(60)).await,
            body => {
                drop(self.seen.send(Seen {
                    node: self.node.clone(),
                    entry: ctx.entry_id().as_str().to_owned(),
                    body: body.to_owned(),
                }));
                ctx.reply(format!("echo:{body}"));
            },
        }
    }
}

struct SlowStop;

/// Settings tuned for tests: quick retries, no background rebalancing or
/// snapshotting unless a test opts in.
pub fn test_settings() -> ShardingSettings {
    ShardingSettings {
        retry_interval: Duration::from_millis(50),
        shard_start_timeout: Duration::from_millis(200),
        coordinator_failure_backoff: Duration::from_millis(100),
        shard_failure_backoff: Duration::from_millis(100),
        entry_restart_backoff: Duration::from_millis(100),
        handoff_timeout: Duration::from_secs(5),
        rebalance_interval: Duration::from_secs(3600),
        snapshot_interval: Duration::from_secs(3600),
        ..ShardingSettings::default()
    }
}

/// Opt-in log output for debugging test runs:
/// `RUST_LOG=shoal=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

pub struct TestNode {
    pub sharding: ClusterSharding,
    pub region: RegionRef,
    pub seen: UnboundedReceiver<Seen>,
}

/// Starts a node and the `counters` entry type on it.
pub fn start_node(
    cluster: &Cluster,
    journal: &Arc<InMemoryJournal>,
    address: &str,
    settings: ShardingSettings,
    remember_entries: bool,
) -> TestNode {
    start_node_with(cluster, journal, address, settings, remember_entries, Vec::new(), None)
}

pub fn start_node_with(
    cluster: &Cluster,
    journal: &Arc<InMemoryJournal>,
    address: &str,
    settings: ShardingSettings,
    remember_entries: bool,
    roles: Vec<String>,
    type_role: Option<String>,
) -> TestNode {
    init_tracing();

    let (seen_tx, seen) = tokio::sync::mpsc::unbounded_channel();

    let sharding = ClusterSharding::new(ClusterShardingOptions {
        cluster: cluster.clone(),
        address: address.to_owned(),
        roles,
        journal: Arc::clone(journal) as Arc<dyn Journal>,
        settings,
    });

    let region = sharding.start(StartOptions {
        type_name: "counters".to_owned(),
        entry_factory: Some(RecordingFactory::new(address, seen_tx)),
        message_extractor: Arc::new(EnvelopeExtractor),
        role: type_role,
        remember_entries,
        allocation_strategy: None,
    });

    TestNode {
        sharding,
        region,
        seen,
    }
}

/// The coordinator's persistence id for the `counters` type under default
/// settings.
pub const COORDINATOR_PID: &str = "/user/sharding/countersCoordinator/singleton";

/// The persistence id of one of the type's shards.
pub fn shard_pid(shard: &str) -> String {
    format!("/sharding/countersShard/{shard}")
}

pub fn region_key(address: &str) -> String {
    format!("{address}/user/sharding/counters")
}

/// The outer tags of every event persisted for `persistence_id`, in order.
pub fn event_tags(journal: &InMemoryJournal, persistence_id: &str) -> Vec<String> {
    journal
        .entries(persistence_id)
        .iter()
        .map(|entry| {
            let value: serde_json::Value = serde_json::from_slice(&entry.payload).unwrap();
            value
                .as_object()
                .and_then(|object| object.keys().next().cloned())
                .unwrap_or_default()
        })
        .collect()
}

/// The persisted events for `persistence_id` decoded as JSON values.
pub fn events(journal: &InMemoryJournal, persistence_id: &str) -> Vec<serde_json::Value> {
    journal
        .entries(persistence_id)
        .iter()
        .map(|entry| serde_json::from_slice(&entry.payload).unwrap())
        .collect()
}

/// Polls `condition` until it holds or ten seconds elapse.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {description}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Receives the next observation, failing the test after ten seconds.
pub async fn expect_seen(seen: &mut UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(10), seen.recv())
        .await
        .expect("timed out waiting for an entry to handle a message")
        .expect("observation stream closed")
}

/// Receives the next observation that is not an entry-creation marker.
pub async fn expect_handled(seen: &mut UnboundedReceiver<Seen>) -> Seen {
    loop {
        let observation = expect_seen(seen).await;
        if observation.body != CREATED {
            return observation;
        }
    }
}
