//! Rebalancing: successful handoff to a less loaded region, and the
//! timeout path when entries refuse to stop.

mod common;

use std::time::Duration;

use common::*;
use shoal::persistence::InMemoryJournal;
use shoal::prelude::*;

fn rebalancing_settings() -> ShardingSettings {
    ShardingSettings {
        rebalance_interval: Duration::from_millis(200),
        least_shard_rebalance_threshold: 1,
        least_shard_max_simultaneous_rebalance: 1,
        ..test_settings()
    }
}

/// Scenario: node-1 hosts two shards, an empty node-2 joins. The
/// coordinator hands the first shard off: its entries stop on node-1, the
/// home is deallocated, and the next touch reallocates it to node-2.
#[tokio::test(flavor = "multi_thread")]
async fn rebalance_moves_a_shard_to_the_emptier_region() {
    let cluster = Cluster::new();
    let journal = InMemoryJournal::new();

    let mut node1 = start_node(&cluster, &journal, "node-1", rebalancing_settings(), false);

    node1.region.route(Envelope::new("a", "e-a", "one"), None);
    node1.region.route(Envelope::new("b", "e-b", "two"), None);
    for _ in 0..2 {
        expect_handled(&mut node1.seen).await;
    }

    let mut node2 = start_node(&cluster, &journal, "node-2", rebalancing_settings(), false);

    // The rebalance picks the first shard of node-1's list.
    wait_until("shard a to be deallocated", || {
        events(&journal, COORDINATOR_PID)
            .iter()
            .any(|event| event.get("ShardHomeDeallocated").is_some())
    })
    .await;

    // Touching the shard again allocates it to node-2, now the least
    // loaded, and messages flow there.
    node1.region.route(Envelope::new("a", "e-a", "three"), None);
    let observation = expect_handled(&mut node2.seen).await;
    assert_eq!(observation.node, "node-2");
    assert_eq!(observation.entry, "e-a");
    assert_eq!(observation.body, "three");

    let deallocated: Vec<serde_json::Value> = events(&journal, COORDINATOR_PID)
        .into_iter()
        .filter_map(|event| event.get("ShardHomeDeallocated").cloned())
        .collect();
    assert_eq!(deallocated[0]["shard"], "a");

    let allocations: Vec<serde_json::Value> = events(&journal, COORDINATOR_PID)
        .into_iter()
        .filter_map(|event| event.get("ShardHomeAllocated").cloned())
        .collect();
    let last = allocations.last().expect("a reallocation event");
    assert_eq!(last["shard"], "a");
    assert_eq!(last["region"], region_key("node-2").as_str());

    node1.sharding.terminate();
    node2.sharding.terminate();
}

/// Scenario: the handed-off shard hosts an entry that never stops. The
/// rebalance worker gives up after the handoff timeout and the shard stays
/// allocated where it was.
#[tokio::test(flavor = "multi_thread")]
async fn handoff_timeout_leaves_the_shard_allocated() {
    let cluster = Cluster::new();
    let journal = InMemoryJournal::new();

    let settings = ShardingSettings {
        handoff_timeout: Duration::from_millis(400),
        ..rebalancing_settings()
    };

    let mut node1 = start_node(&cluster, &journal, "node-1", settings.clone(), false);

    node1.region.route(Envelope::new("a", "e-a", "one"), None);
    node1.region.route(Envelope::new("b", "e-b", "two"), None);
    for _ in 0..2 {
        expect_handled(&mut node1.seen).await;
    }
    // Wedge shard a's entry; the stop message will never be processed.
    node1.region.route(Envelope::new("a", "e-a", "hang"), None);

    let node2 = start_node(&cluster, &journal, "node-2", settings, false);

    // Give several rebalance rounds the chance to try and time out.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let tags = event_tags(&journal, COORDINATOR_PID);
    assert!(
        !tags.contains(&"ShardHomeDeallocated".to_owned()),
        "a timed-out handoff must not deallocate the shard"
    );

    node1.sharding.terminate();
    node2.sharding.terminate();
}
