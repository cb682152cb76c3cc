//! Buffer bounds, shard persistence retries and snapshot-based recovery.

mod common;

use std::time::Duration;

use common::*;
use shoal::persistence::InMemoryJournal;
use shoal::prelude::*;

/// Scenario: fifteen messages arrive for a shard with no resolvable home
/// and a buffer capped at ten. The first ten are buffered, the rest drop
/// to dead letters, and once a home exists the ten buffered ones are
/// delivered in arrival order.
#[tokio::test(flavor = "multi_thread")]
async fn buffer_overflow_drops_to_dead_letters() {
    let cluster = Cluster::new();
    let journal = InMemoryJournal::new();

    let settings = ShardingSettings {
        buffer_size: 10,
        ..test_settings()
    };

    // Role-gated into proxying: no coordinator is reachable yet.
    let node1 = start_node_with(
        &cluster,
        &journal,
        "node-1",
        settings.clone(),
        false,
        Vec::new(),
        Some("entries".to_owned()),
    );
    let mut dead_letters = node1.sharding.dead_letters().subscribe();

    for i in 1..=15 {
        node1.region.route(Envelope::new("z", "e1", &format!("m{i}")), None);
    }

    wait_until("five messages to drop", || node1.sharding.dead_letters().count() == 5).await;
    for _ in 0..5 {
        let dropped = dead_letters.recv().await.expect("dead letter stream closed");
        let envelope = dropped.message.downcast_ref::<Envelope>().expect("an envelope");
        assert!(
            ["m11", "m12", "m13", "m14", "m15"].contains(&envelope.body.as_str()),
            "only the overflowing tail may drop, got {}",
            envelope.body
        );
    }

    let mut node2 = start_node_with(
        &cluster,
        &journal,
        "node-2",
        settings,
        false,
        vec!["entries".to_owned()],
        Some("entries".to_owned()),
    );

    for i in 1..=10 {
        assert_eq!(expect_handled(&mut node2.seen).await.body, format!("m{i}"));
    }

    node1.sharding.terminate();
    node2.sharding.terminate();
}

/// A failed `EntryStarted` append blocks the entry's deliveries; the shard
/// retries the write after its backoff and the buffered message then
/// reaches the freshly started entry.
#[tokio::test(flavor = "multi_thread")]
async fn shard_retries_a_failed_entry_start() {
    let cluster = Cluster::new();
    let journal = InMemoryJournal::new();

    let mut node1 = start_node(&cluster, &journal, "node-1", test_settings(), true);

    // Allocate the shard first so the only append left is the entry start.
    node1.region.route(Envelope::new("a", "e1", "warm-up"), None);
    assert_eq!(expect_handled(&mut node1.seen).await.body, "warm-up");

    journal.fail_next_appends(1);
    node1.region.route(Envelope::new("a", "e2", "delayed"), None);

    let observation = expect_handled(&mut node1.seen).await;
    assert_eq!(observation.entry, "e2");
    assert_eq!(observation.body, "delayed");

    let tags = event_tags(&journal, &shard_pid("a"));
    assert_eq!(
        tags.iter().filter(|tag| *tag == "EntryStarted").count(),
        2,
        "the retried write must appear exactly once, got {tags:?}"
    );

    node1.sharding.terminate();
}

/// Coordinator state recovered from a snapshot equals the state recovered
/// from the raw log: after a failover of a snapshotting coordinator, old
/// shards still resolve.
#[tokio::test(flavor = "multi_thread")]
async fn failover_recovers_from_a_snapshot() {
    let cluster = Cluster::new();
    let journal = InMemoryJournal::new();

    let settings = ShardingSettings {
        snapshot_interval: Duration::from_millis(150),
        ..test_settings()
    };

    let mut node1 = start_node(&cluster, &journal, "node-1", settings.clone(), false);
    wait_until("node-1 to register", || {
        event_tags(&journal, COORDINATOR_PID).contains(&"ShardRegionRegistered".to_owned())
    })
    .await;

    let mut node2 = start_node(&cluster, &journal, "node-2", settings, false);

    node2.region.route(Envelope::new("s1", "e1", "one"), None);
    assert_eq!(expect_handled(&mut node1.seen).await.node, "node-1");
    node2.region.route(Envelope::new("s2", "e2", "two"), None);
    assert_eq!(expect_handled(&mut node2.seen).await.node, "node-2");

    // Let at least one snapshot cover the allocations.
    tokio::time::sleep(Duration::from_millis(400)).await;

    node1.sharding.terminate();

    node2.region.route(Envelope::new("s2", "e2", "three"), None);
    assert_eq!(expect_handled(&mut node2.seen).await.body, "three");
    node2.region.route(Envelope::new("s1", "e1", "four"), None);
    let observation = expect_handled(&mut node2.seen).await;
    assert_eq!(observation.node, "node-2");
    assert_eq!(observation.body, "four");

    node2.sharding.terminate();
}
