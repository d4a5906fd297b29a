//! redb table definitions for the catalog store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Table nodes (roots and partitions) keyed by `{node_id}`.
pub const TABLE_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("table_nodes");

/// Shard placements keyed by `{node_id}:{shard_index:010}`.
pub const SHARD_PLACEMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("shard_placements");

/// Catalog-wide bookkeeping (currently only the version counter).
pub const CATALOG_META: TableDefinition<&str, &[u8]> = TableDefinition::new("catalog_meta");

/// Key of the version counter in [`CATALOG_META`].
pub const VERSION_KEY: &str = "version";
