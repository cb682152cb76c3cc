//! The cluster membership collaborator.
//!
//! Sharding only needs four things from a membership service: a snapshot of
//! the current up-members, a stream of [`MemberEvent`]s, a role query, and a
//! total age ordering. [`Cluster`] provides them for a set of nodes living
//! in one process, which is both the test fabric and the seam where a real
//! membership service would be bridged in.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::actor::PathRegistry;

/// A cluster node as seen by the membership service.
///
/// The `up_number` is assigned once when the member joins and never changes;
/// it is the age order rebalancing and singleton election depend on.
#[derive(Clone, Debug)]
pub struct Member {
    address: Arc<str>,
    up_number: u64,
    roles: HashSet<String>,
}

impl Member {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn up_number(&self) -> u64 {
        self.up_number
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Whether this member joined the cluster before `other`. Ties on the
    /// up-number can not occur within one [`Cluster`], but the address
    /// keeps the order total anyway.
    pub fn is_older_than(&self, other: &Member) -> bool {
        (self.up_number, &self.address) < (other.up_number, &other.address)
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.up_number == other.up_number && self.address == other.address
    }
}

impl Eq for Member {}

impl PartialOrd for Member {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Member {
    /// Oldest first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.up_number, &self.address).cmp(&(other.up_number, &other.address))
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(up={})", self.address, self.up_number)
    }
}

/// A membership change, as published to subscribers.
#[derive(Clone, Debug)]
pub enum MemberEvent {
    MemberUp(Member),
    MemberRemoved(Member),
}

struct ClusterInner {
    members: RwLock<BTreeMap<Arc<str>, Member>>,
    events: broadcast::Sender<MemberEvent>,
    next_up_number: AtomicU64,
    registry: PathRegistry,
}

/// An in-process cluster: the shared fabric every node of a deployment (or
/// a test) hangs off.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);

        Self {
            inner: Arc::new(ClusterInner {
                members: RwLock::new(BTreeMap::new()),
                events,
                next_up_number: AtomicU64::new(1),
                registry: PathRegistry::new(),
            }),
        }
    }

    /// Adds a member and publishes `MemberUp`. Joining an address that is
    /// already present removes the old incarnation first; the new one gets
    /// a fresh up-number and is therefore the youngest member.
    pub fn join(&self, address: &str, roles: impl IntoIterator<Item = String>) -> Member {
        if self.inner.members.read().contains_key(address) {
            self.leave(address);
        }

        let member = Member {
            address: Arc::from(address),
            up_number: self.inner.next_up_number.fetch_add(1, Ordering::Relaxed),
            roles: roles.into_iter().collect(),
        };

        info!("[Cluster] Member {} is up", member);
        self.inner.members.write().insert(Arc::clone(&member.address), member.clone());
        drop(self.inner.events.send(MemberEvent::MemberUp(member.clone())));

        member
    }

    /// Removes a member and publishes `MemberRemoved`. Unknown addresses
    /// are ignored.
    pub fn leave(&self, address: &str) {
        let removed = self.inner.members.write().remove(address);

        if let Some(member) = removed {
            info!("[Cluster] Member {} removed", member);
            drop(self.inner.events.send(MemberEvent::MemberRemoved(member)));
        }
    }

    /// Snapshot of the current members, oldest first.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.inner.members.read().values().cloned().collect();
        members.sort();
        members
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.inner.events.subscribe()
    }

    /// The path registry shared by all nodes on this fabric; logical
    /// addresses resolve through it.
    pub fn registry(&self) -> &PathRegistry {
        &self.inner.registry
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster").field("members", &self.inner.members.read().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn age_order_follows_join_order() {
        let cluster = Cluster::new();
        let first = cluster.join("node-1", Vec::new());
        let second = cluster.join("node-2", Vec::new());

        assert!(first.is_older_than(&second));
        assert!(!second.is_older_than(&first));
        assert_eq!(cluster.members(), vec![first, second]);
    }

    #[tokio::test]
    async fn rejoin_makes_the_member_youngest() {
        let cluster = Cluster::new();
        let first = cluster.join("node-1", Vec::new());
        let second = cluster.join("node-2", Vec::new());
        let rejoined = cluster.join("node-1", Vec::new());

        assert!(first.is_older_than(&second));
        assert!(second.is_older_than(&rejoined));
        assert_eq!(cluster.members().first(), Some(&second));
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let cluster = Cluster::new();
        let mut events = cluster.subscribe();

        let member = cluster.join("node-1", Some("entries".to_owned()));
        cluster.leave("node-1");

        match events.recv().await {
            Ok(MemberEvent::MemberUp(m)) => {
                assert_eq!(m, member);
                assert!(m.has_role("entries"));
            },
            other => panic!("expected MemberUp, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Ok(MemberEvent::MemberRemoved(_))));
    }
}
