//! Target resolver — which physical objects sit under a table node.
//!
//! `resolve` returns the requested node first, then every descendant in
//! creation order, each paired with its shard placements. It only reads
//! the catalog.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use shardline_catalog::{CatalogStore, NodeId, ShardPlacement, TableNode};

use crate::error::{EngineError, EngineResult};

/// A physical object that receives metadata: a node's local relation, or
/// one of its shard placements once the node is distributed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub node_id: NodeId,
    pub placement: Option<ShardPlacement>,
}

impl Target {
    pub fn local(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            placement: None,
        }
    }

    pub fn shard(placement: ShardPlacement) -> Self {
        Self {
            node_id: placement.node_id.clone(),
            placement: Some(placement),
        }
    }

    /// Physical relation handle addressed by this target.
    pub fn relation(&self) -> &str {
        match &self.placement {
            Some(p) => &p.relation,
            None => &self.node_id,
        }
    }

    /// Worker holding the relation (`None` for a local relation).
    pub fn worker(&self) -> Option<&str> {
        self.placement.as_ref().map(|p| p.worker.as_str())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.placement {
            Some(p) => write!(f, "{}@{}", p.relation, p.worker),
            None => f.write_str(&self.node_id),
        }
    }
}

/// A table node together with its placements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
    pub node: TableNode,
    pub placements: Vec<ShardPlacement>,
}

impl ResolvedNode {
    /// Targets of this node: its placements, or the local relation when
    /// the node has none.
    pub fn targets(&self) -> Vec<Target> {
        if self.placements.is_empty() {
            vec![Target::local(&self.node.id)]
        } else {
            self.placements.iter().cloned().map(Target::shard).collect()
        }
    }
}

/// Resolve `root_id` and all of its descendants.
///
/// Fails with [`EngineError::UnknownRoot`] if `root_id` does not exist.
pub fn resolve(catalog: &CatalogStore, root_id: &str) -> EngineResult<Vec<ResolvedNode>> {
    let nodes = catalog.list_nodes()?;
    if !nodes.iter().any(|n| n.id == root_id) {
        return Err(EngineError::UnknownRoot(root_id.to_string()));
    }

    // `list_nodes` is in creation order and a child is always created after
    // its parent, so one pass collects the whole subtree.
    let mut members: HashSet<&str> = HashSet::from([root_id]);
    let mut subtree: Vec<&TableNode> = Vec::new();
    for node in &nodes {
        if node.id == root_id {
            subtree.insert(0, node);
        } else if node
            .parent
            .as_deref()
            .is_some_and(|p| members.contains(p))
        {
            members.insert(node.id.as_str());
            subtree.push(node);
        }
    }

    subtree
        .into_iter()
        .map(|node| {
            Ok(ResolvedNode {
                placements: catalog.placements_for(&node.id)?,
                node: node.clone(),
            })
        })
        .collect()
}
