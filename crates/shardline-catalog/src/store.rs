//! CatalogStore — redb-backed persistence for table nodes and placements.
//!
//! Provides typed operations over table nodes and shard placements. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{CatalogError, CatalogResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `CatalogError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| CatalogError::$variant(e.to_string())
    };
}

/// Thread-safe catalog store backed by redb.
#[derive(Clone)]
pub struct CatalogStore {
    db: Arc<Database>,
}

impl CatalogStore {
    /// Open (or create) a persistent catalog at the given path.
    pub fn open(path: &Path) -> CatalogResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "catalog opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory catalog (for testing).
    pub fn open_in_memory() -> CatalogResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory catalog opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> CatalogResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TABLE_NODES).map_err(map_err!(Table))?;
        txn.open_table(SHARD_PLACEMENTS).map_err(map_err!(Table))?;
        txn.open_table(CATALOG_META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Versioning ─────────────────────────────────────────────────

    /// Current catalog version (0 for a fresh catalog).
    pub fn version(&self) -> CatalogResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CATALOG_META).map_err(map_err!(Table))?;
        match table.get(VERSION_KEY).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Ok(0),
        }
    }

    /// Increment the version inside `txn` and return the new value.
    fn bump_version(txn: &WriteTransaction) -> CatalogResult<u64> {
        let mut table = txn.open_table(CATALOG_META).map_err(map_err!(Table))?;
        let current: u64 = match table.get(VERSION_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            }
            None => 0,
        };
        let next = current + 1;
        let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
        table
            .insert(VERSION_KEY, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(next)
    }

    // ── Table nodes ────────────────────────────────────────────────

    /// Insert a new node. Stamps `seq`, `version` and `created_at`.
    ///
    /// Fails with [`CatalogError::AlreadyExists`] if the id is taken.
    pub fn insert_node(&self, node: &TableNode) -> CatalogResult<TableNode> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let table = txn.open_table(TABLE_NODES).map_err(map_err!(Table))?;
            if table.get(node.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(CatalogError::AlreadyExists(node.id.clone()));
            }
            drop(table);
            let version = Self::bump_version(&txn)?;
            let mut stored = node.clone();
            stored.seq = version;
            stored.version = version;
            stored.created_at = epoch_secs();
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(TABLE_NODES).map_err(map_err!(Table))?;
            table
                .insert(stored.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %stored.id, version = stored.version, "table node inserted");
        Ok(stored)
    }

    /// Update an existing node. Stamps `version`.
    ///
    /// Fails with [`CatalogError::NotFound`] if the node does not exist.
    pub fn put_node(&self, node: &TableNode) -> CatalogResult<TableNode> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let table = txn.open_table(TABLE_NODES).map_err(map_err!(Table))?;
            if table.get(node.id.as_str()).map_err(map_err!(Read))?.is_none() {
                return Err(CatalogError::NotFound(node.id.clone()));
            }
            drop(table);
            let mut stored = node.clone();
            stored.version = Self::bump_version(&txn)?;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(TABLE_NODES).map_err(map_err!(Table))?;
            table
                .insert(stored.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %stored.id, version = stored.version, "table node updated");
        Ok(stored)
    }

    /// Get a node by id.
    pub fn get_node(&self, node_id: &str) -> CatalogResult<Option<TableNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TABLE_NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: TableNode =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all nodes in creation order.
    pub fn list_nodes(&self) -> CatalogResult<Vec<TableNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TABLE_NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: TableNode =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        results.sort_by_key(|n| n.seq);
        Ok(results)
    }

    /// Direct children of `parent_id` in creation order.
    pub fn children_of(&self, parent_id: &str) -> CatalogResult<Vec<TableNode>> {
        Ok(self
            .list_nodes()?
            .into_iter()
            .filter(|n| n.parent.as_deref() == Some(parent_id))
            .collect())
    }

    /// Delete a node and its placements. Returns true if the node existed.
    pub fn remove_node(&self, node_id: &str) -> CatalogResult<bool> {
        let prefix = placement_prefix(node_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let mut removed = Vec::new();
        {
            let mut table = txn.open_table(TABLE_NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
            let mut placements = txn.open_table(SHARD_PLACEMENTS).map_err(map_err!(Table))?;
            for entry in placements.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let key = key.value();
                if key.starts_with(&prefix) {
                    removed.push(key.to_string());
                }
            }
            for key in &removed {
                placements.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        if existed || !removed.is_empty() {
            Self::bump_version(&txn)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %node_id, existed, placements = removed.len(), "table node removed");
        Ok(existed)
    }

    // ── Shard placements ───────────────────────────────────────────

    /// Insert or update a batch of placements in one transaction.
    pub fn put_placements(&self, placements: &[ShardPlacement]) -> CatalogResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SHARD_PLACEMENTS).map_err(map_err!(Table))?;
            for placement in placements {
                let key = placement.table_key();
                let value = serde_json::to_vec(placement).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        Self::bump_version(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = placements.len(), "shard placements stored");
        Ok(())
    }

    /// All placements of a node, ordered by shard index.
    pub fn placements_for(&self, node_id: &str) -> CatalogResult<Vec<ShardPlacement>> {
        let prefix = placement_prefix(node_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SHARD_PLACEMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let placement: ShardPlacement =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(placement);
            }
        }
        Ok(results)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
