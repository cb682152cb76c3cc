//! Coordinator failover: the oldest node disappears, the next oldest
//! recovers the coordinator from the journal and routing continues.

mod common;

use std::time::Duration;

use common::*;
use shoal::persistence::InMemoryJournal;
use shoal::prelude::*;

/// Scenario: node-1 hosts the coordinator and one shard, node-2 hosts
/// another. Node-1 is removed; node-2 becomes oldest, takes the
/// coordinator over from the journal, re-registers, and both old and new
/// shards keep flowing, including the one left homeless by node-1's
/// death.
#[tokio::test(flavor = "multi_thread")]
async fn coordinator_failover_keeps_routing() {
    let cluster = Cluster::new();
    let journal = InMemoryJournal::new();

    let mut node1 = start_node(&cluster, &journal, "node-1", test_settings(), false);
    wait_until("node-1 to register", || {
        event_tags(&journal, COORDINATOR_PID).contains(&"ShardRegionRegistered".to_owned())
    })
    .await;

    let mut node2 = start_node(&cluster, &journal, "node-2", test_settings(), false);
    wait_until("node-2 to register", || {
        event_tags(&journal, COORDINATOR_PID)
            .iter()
            .filter(|tag| *tag == "ShardRegionRegistered")
            .count()
            == 2
    })
    .await;

    // Least-shard with the registration order fixed: s1 lands on node-1,
    // s2 on node-2.
    node2.region.route(Envelope::new("s1", "e1", "one"), None);
    assert_eq!(expect_handled(&mut node1.seen).await.node, "node-1");
    node2.region.route(Envelope::new("s2", "e2", "two"), None);
    assert_eq!(expect_handled(&mut node2.seen).await.node, "node-2");

    node1.sharding.terminate();

    // The new coordinator recovers on node-2 and persists the old
    // region's termination.
    wait_until("node-1's region to be terminated", || {
        events(&journal, COORDINATOR_PID).iter().any(|event| {
            event
                .get("ShardRegionTerminated")
                .is_some_and(|body| body["region"] == region_key("node-1").as_str())
        })
    })
    .await;

    // A shard that stayed on node-2 keeps flowing.
    node2.region.route(Envelope::new("s2", "e2", "three"), None);
    assert_eq!(expect_handled(&mut node2.seen).await.body, "three");

    // A brand-new shard gets allocated by the new coordinator.
    node2.region.route(Envelope::new("s3", "e3", "four"), None);
    assert_eq!(expect_handled(&mut node2.seen).await.body, "four");

    // The shard orphaned by node-1's death is reallocated on touch.
    node2.region.route(Envelope::new("s1", "e1", "five"), None);
    let observation = expect_handled(&mut node2.seen).await;
    assert_eq!(observation.node, "node-2");
    assert_eq!(observation.body, "five");

    node2.sharding.terminate();
}

/// A persistence failure stops the coordinator; its supervisor restarts it
/// after the backoff, recovery reproduces the state from the log, and the
/// pending allocation goes through on the region's retry.
#[tokio::test(flavor = "multi_thread")]
async fn coordinator_restarts_after_a_persistence_failure() {
    let cluster = Cluster::new();
    let journal = InMemoryJournal::new();

    let mut node1 = start_node(&cluster, &journal, "node-1", test_settings(), false);
    wait_until("node-1 to register", || {
        event_tags(&journal, COORDINATOR_PID).contains(&"ShardRegionRegistered".to_owned())
    })
    .await;

    // The next coordinator append fails: the allocation for the new shard
    // kills the coordinator.
    journal.fail_next_appends(1);
    node1.region.route(Envelope::new("a", "e1", "hello"), None);

    // The supervisor restarts the coordinator, the region re-registers
    // and retries the home request; the message still arrives.
    let observation = expect_handled(&mut node1.seen).await;
    assert_eq!(observation.body, "hello");

    let tags = event_tags(&journal, COORDINATOR_PID);
    assert_eq!(tags.iter().filter(|tag| *tag == "ShardHomeAllocated").count(), 1);

    node1.sharding.terminate();
}

/// While no coordinator is reachable, messages for unknown shards are
/// buffered and flushed once a coordinator appears, in arrival order.
#[tokio::test(flavor = "multi_thread")]
async fn buffered_messages_flush_in_order_once_a_home_is_known() {
    let cluster = Cluster::new();
    let journal = InMemoryJournal::new();

    // node-1 lacks the role, so it proxies and cannot host a coordinator.
    let mut node1 = start_node_with(
        &cluster,
        &journal,
        "node-1",
        test_settings(),
        false,
        Vec::new(),
        Some("entries".to_owned()),
    );

    for i in 1..=5 {
        node1.region.route(Envelope::new("z", "e1", &format!("m{i}")), None);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The role-carrying node brings the coordinator and hosts the shard.
    let mut node2 = start_node_with(
        &cluster,
        &journal,
        "node-2",
        test_settings(),
        false,
        vec!["entries".to_owned()],
        Some("entries".to_owned()),
    );

    for i in 1..=5 {
        let observation = expect_handled(&mut node2.seen).await;
        assert_eq!(observation.node, "node-2");
        assert_eq!(observation.body, format!("m{i}"));
    }

    assert!(node1.seen.try_recv().is_err(), "the proxy node must not host entries");

    node1.sharding.terminate();
    node2.sharding.terminate();
}
