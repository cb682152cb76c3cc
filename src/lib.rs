//! shoal is a Rust library for transparent cluster sharding of stateful,
//! logically-addressed workers.
//!
//! Applications define *entries*, stateful workers addressed by an
//! application-chosen id, and shoal spreads them over the nodes of a
//! cluster, guaranteeing at most one live instance per id and routing
//! messages to wherever an entry currently lives. Entries are grouped into
//! *shards*, the unit of relocation; an event-sourced *coordinator*
//! singleton owns the shard map and rebalances it as nodes come and go.
//!
//! The ten-second tour:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use shoal::cluster::Cluster;
//! use shoal::persistence::InMemoryJournal;
//! use shoal::sharding::{ClusterSharding, ClusterShardingOptions, StartOptions};
//! # use shoal::sharding::{Entry, EntryContext, EntryFactory, EntryId, Message,
//! #     MessageExtractor, ShardId, ShardingSettings};
//! # struct Counter;
//! # #[async_trait::async_trait]
//! # impl Entry for Counter {
//! #     async fn handle(&mut self, _message: Message, _ctx: &mut EntryContext) {}
//! # }
//! # struct CounterFactory;
//! # impl EntryFactory for CounterFactory {
//! #     fn create(&self, _entry_id: &EntryId) -> Box<dyn Entry> { Box::new(Counter) }
//! # }
//! # struct Extractor;
//! # impl MessageExtractor for Extractor {
//! #     fn entry_id(&self, _message: &Message) -> Option<EntryId> { None }
//! #     fn shard_id(&self, _message: &Message) -> ShardId { ShardId::from("0") }
//! # }
//!
//! let cluster = Cluster::new();
//! let journal = InMemoryJournal::new();
//!
//! let node = ClusterSharding::new(ClusterShardingOptions {
//!     cluster,
//!     address: "node-1".to_owned(),
//!     roles: Vec::new(),
//!     journal,
//!     settings: ShardingSettings::default(),
//! });
//!
//! let counters = node.start(StartOptions {
//!     type_name: "counters".to_owned(),
//!     entry_factory: Some(Arc::new(CounterFactory)),
//!     message_extractor: Arc::new(Extractor),
//!     role: None,
//!     remember_entries: false,
//!     allocation_strategy: None,
//! });
//! # drop(counters);
//! ```
//!
//! Messages handed to the returned region are routed by the extractor's
//! shard id: locally when the shard lives on this node, to the owning
//! remote region otherwise, and into a bounded buffer while the shard's
//! home is still being resolved.
//!
//! Delivery is at-most-once end to end. Entry state never moves with a
//! rebalance; an entry restarts fresh on its new node, or from the
//! persisted entry set when its type remembers entries.

#![deny(rust_2018_idioms)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod actor;
pub mod cluster;
mod constants;
pub mod error;
mod internal;
pub mod persistence;
pub mod sharding;

pub use crate::error::{Error, Result};

/// A set of exports for glob-importing the commonly used surface.
pub mod prelude {
    pub use crate::cluster::{Cluster, Member, MemberEvent};
    pub use crate::error::{Error, Result};
    pub use crate::persistence::{InMemoryJournal, Journal};
    pub use crate::sharding::{
        recipient,
        AllocationStrategy,
        ClusterSharding,
        ClusterShardingOptions,
        DeadLetter,
        DeadLetters,
        Entry,
        EntryContext,
        EntryFactory,
        EntryId,
        LeastShardAllocationStrategy,
        Message,
        MessageExtractor,
        Recipient,
        RegionRef,
        ShardId,
        ShardingSettings,
        StartOptions,
        StopEntry,
    };
}
