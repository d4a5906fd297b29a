//! shardline-catalog — metadata store for partitioned, distributed tables.
//!
//! Backed by [redb](https://docs.rs/redb), records every table node (root
//! or partition) with its columns, access method, identity spec and
//! installed exclusion rules, plus the shard placements of distributed
//! nodes.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Placements use composite keys (`{node_id}:{shard_index}`) so a node's
//! placements come back from one prefix scan in shard order.
//!
//! Every write bumps a catalog-wide version inside the same transaction
//! and stamps the written node with it. The version is never reset; a
//! node's `seq` (the version at creation) gives sibling creation order.
//!
//! The `CatalogStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{CatalogError, CatalogResult};
pub use store::CatalogStore;
pub use types::*;
