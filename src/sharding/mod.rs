//! Transparent sharding of stateful entries across the cluster.
//!
//! Messages are addressed by an application-defined entry identifier; the
//! library guarantees that at most one entry with a given identifier is
//! alive anywhere in the cluster, and routes messages to wherever it
//! currently lives. Entries are grouped into shards, the unit of
//! relocation.
//!
//! Three roles cooperate to make that happen:
//!
//! * the **coordinator**, an event-sourced cluster singleton owning the
//!   authoritative shard-to-region mapping and driving rebalances,
//! * one **region** per node and entry type, routing messages, buffering
//!   them while a shard's home is unknown, and hosting the local shards,
//! * one **shard** per hosted shard id, owning the entry lifecycles.
//!
//! [`ClusterSharding`] is the per-node entry point: [`start`] an entry type
//! once per node and hand application messages to the returned
//! [`RegionRef`].
//!
//! Delivery is at-most-once; callers needing more layer idempotence or
//! their own redelivery on top. Entry state is not transferred on
//! rebalance: a moved entry starts fresh, or from its persisted membership
//! when the type remembers entries.
//!
//! [`start`]: ClusterSharding::start

mod coordinator;
mod entry;
mod handoff;
mod messages;
mod region;
mod settings;
mod shard;

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use indexmap::IndexMap;

pub use self::coordinator::allocation::{AllocationStrategy, LeastShardAllocationStrategy};
use self::coordinator::singleton::{spawn_singleton_manager, SingletonOptions};
pub use self::coordinator::state::RegionKey;
pub use self::entry::{
    recipient,
    DeadLetter,
    DeadLetters,
    Entry,
    EntryContext,
    EntryFactory,
    Message,
    MessageExtractor,
    Recipient,
    StopEntry,
};
use self::region::{RegionOptions, ShardRegion};
pub use self::region::RegionRef;
pub use self::settings::ShardingSettings;
use crate::actor::TaskSet;
use crate::cluster::{Cluster, Member};
use crate::constants;
use crate::internal::tokio::spawn_named;
use crate::persistence::Journal;

/// Identifies a group of entries managed and relocated together.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

/// Identifies one entry within its type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(String);

macro_rules! id_string {
    ($($name:ident;)*) => {
        $(
            impl $name {
                pub fn as_str(&self) -> &str {
                    &self.0
                }

                pub fn is_empty(&self) -> bool {
                    self.0.is_empty()
                }
            }

            impl From<&str> for $name {
                fn from(id: &str) -> Self {
                    Self(id.to_owned())
                }
            }

            impl From<String> for $name {
                fn from(id: String) -> Self {
                    Self(id)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }
        )*
    };
}

id_string! {
    ShardId;
    EntryId;
}

pub(crate) fn region_path(address: &str, guardian_name: &str, type_name: &str) -> String {
    format!("{address}/user/{guardian_name}/{type_name}")
}

pub(crate) fn coordinator_singleton_path(
    address: &str,
    guardian_name: &str,
    type_name: &str,
) -> String {
    format!(
        "{address}/user/{guardian_name}/{type_name}Coordinator/{}",
        constants::SINGLETON_NAME
    )
}

/// The coordinator's persistence id: its singleton path with no address,
/// identical from wherever the singleton runs.
pub(crate) fn coordinator_persistence_id(guardian_name: &str, type_name: &str) -> String {
    format!("/user/{guardian_name}/{type_name}Coordinator/{}", constants::SINGLETON_NAME)
}

/// Everything needed to start one entry type on a node.
pub struct StartOptions {
    /// Name of the entry type; regions of the same type across nodes find
    /// each other through it.
    pub type_name: String,
    /// Produces entry behaviors. `None` makes this node a proxy for the
    /// type: it routes but hosts nothing.
    pub entry_factory: Option<Arc<dyn EntryFactory>>,
    /// Extracts entry and shard ids from application messages.
    pub message_extractor: Arc<dyn MessageExtractor>,
    /// Overrides the node settings' role for this type.
    pub role: Option<String>,
    /// Persist the entry set of every shard, so a relocated or restarted
    /// shard recreates its entries.
    pub remember_entries: bool,
    /// Overrides the default least-shard allocation strategy.
    pub allocation_strategy: Option<Arc<dyn AllocationStrategy>>,
}

/// Per-node options for [`ClusterSharding::new`].
pub struct ClusterShardingOptions {
    pub cluster: Cluster,
    /// This node's address on the cluster fabric.
    pub address: String,
    pub roles: Vec<String>,
    pub journal: Arc<dyn Journal>,
    pub settings: ShardingSettings,
}

struct ShardingNode {
    cluster: Cluster,
    member: Member,
    settings: Arc<ShardingSettings>,
    journal: Arc<dyn Journal>,
    dead_letters: Arc<DeadLetters>,
    regions: DashMap<String, RegionRef>,
    registered_paths: parking_lot::Mutex<Vec<String>>,
    tasks: Arc<TaskSet>,
}

/// The per-node registry of sharded entry types.
///
/// Creating one joins the node to the cluster. [`Self::start`] is
/// idempotent per type name and may be called from any context; the
/// region endpoint it returns is the node's door to the type.
#[derive(Clone)]
pub struct ClusterSharding {
    inner: Arc<ShardingNode>,
}

impl ClusterSharding {
    pub fn new(options: ClusterShardingOptions) -> Self {
        let member = options.cluster.join(&options.address, options.roles);

        Self {
            inner: Arc::new(ShardingNode {
                cluster: options.cluster,
                member,
                settings: Arc::new(options.settings),
                journal: options.journal,
                dead_letters: Arc::new(DeadLetters::default()),
                regions: DashMap::new(),
                registered_paths: parking_lot::Mutex::new(Vec::new()),
                tasks: Arc::new(TaskSet::default()),
            }),
        }
    }

    /// Starts sharding for one entry type, returning its region endpoint.
    /// Starting an already started type returns the existing endpoint.
    pub fn start(&self, options: StartOptions) -> RegionRef {
        match self.inner.regions.entry(options.type_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let region = self.start_type(options);
                entry.insert(region.clone());
                region
            },
        }
    }

    fn start_type(&self, options: StartOptions) -> RegionRef {
        let node = &self.inner;
        let settings = Arc::clone(&node.settings);
        let role = options.role.or_else(|| settings.role.clone());
        let role_matches =
            role.as_ref().map_or(true, |role| node.member.has_role(role));
        // A node outside the role, or one without a factory, only proxies.
        let factory = if role_matches { options.entry_factory } else { None };
        let hosting = factory.is_some();

        info!(
            "[ClusterSharding {}] Starting type {} ({})",
            node.member.address(),
            options.type_name,
            if hosting { "hosting" } else { "proxy" }
        );

        if hosting {
            let strategy = options.allocation_strategy.unwrap_or_else(|| {
                Arc::new(LeastShardAllocationStrategy::new(
                    settings.least_shard_rebalance_threshold,
                    settings.least_shard_max_simultaneous_rebalance,
                ))
            });
            let singleton_path = coordinator_singleton_path(
                node.member.address(),
                &settings.guardian_name,
                &options.type_name,
            );
            // The supervisor registers this path while a coordinator runs;
            // remember it so terminate() can clear it even mid-run.
            node.registered_paths.lock().push(singleton_path.clone());

            spawn_singleton_manager(SingletonOptions {
                type_name: options.type_name.clone(),
                path: singleton_path,
                persistence_id: coordinator_persistence_id(
                    &settings.guardian_name,
                    &options.type_name,
                ),
                settings: Arc::clone(&settings),
                cluster: node.cluster.clone(),
                member: node.member.clone(),
                role: role.clone(),
                strategy,
                journal: Arc::clone(&node.journal),
                tasks: Arc::clone(&node.tasks),
            });
        }

        let path = region_path(node.member.address(), &settings.guardian_name, &options.type_name);
        let (region_ref, region) = ShardRegion::new(path.clone(), RegionOptions {
            type_name: options.type_name,
            settings,
            cluster: node.cluster.clone(),
            role,
            extractor: options.message_extractor,
            factory,
            remember_entries: options.remember_entries,
            journal: Arc::clone(&node.journal),
            dead_letters: Arc::clone(&node.dead_letters),
            tasks: Arc::clone(&node.tasks),
        });

        node.cluster.registry().register(path.clone(), region_ref.clone());
        node.registered_paths.lock().push(path);

        node.tasks.track(spawn_named("region::run", async move {
            drop(region.run().await);
        }));

        region_ref
    }

    /// The region endpoint of an already started type.
    pub fn region(&self, type_name: &str) -> Option<RegionRef> {
        self.inner.regions.get(type_name).map(|region| region.value().clone())
    }

    pub fn member(&self) -> &Member {
        &self.inner.member
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetters> {
        &self.inner.dead_letters
    }

    /// Tears the node down: aborts every task spawned for it, removes its
    /// registry paths and leaves the cluster. The in-process stand-in for
    /// stopping or crashing the node.
    pub fn terminate(&self) {
        info!("[ClusterSharding {}] Terminating", self.inner.member.address());

        self.inner.tasks.abort_all();
        for path in self.inner.registered_paths.lock().drain(..) {
            self.inner.cluster.registry().deregister(&path);
        }
        self.inner.regions.clear();
        self.inner.cluster.leave(self.inner.member.address());
    }
}

impl fmt::Debug for ClusterSharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSharding")
            .field("member", &self.inner.member)
            .field("types", &self.inner.regions.len())
            .finish()
    }
}
