//! Shard placement — assigning a distributed node's shards to workers.
//!
//! Shards are dealt round-robin over the worker list. Every node of one
//! partitioned table uses the same assignment, so shard `i` of each
//! partition lives on the same worker as shard `i` of the root.

use shardline_catalog::{ShardPlacement, WorkerId};
use tracing::debug;

/// Assign `shard_count` shard indexes to `workers`, round-robin.
///
/// Returns an empty assignment when there are no workers.
pub fn assign_shards(shard_count: u32, workers: &[WorkerId]) -> Vec<(u32, WorkerId)> {
    if workers.is_empty() {
        return Vec::new();
    }
    let assignment: Vec<(u32, WorkerId)> = (0..shard_count)
        .map(|shard| (shard, workers[shard as usize % workers.len()].clone()))
        .collect();
    debug!(shard_count, workers = workers.len(), "shards assigned");
    assignment
}

/// Placements of `node_id` under an assignment.
pub fn placements_for_node(node_id: &str, assignment: &[(u32, WorkerId)]) -> Vec<ShardPlacement> {
    assignment
        .iter()
        .map(|(shard, worker)| ShardPlacement::new(node_id, *shard, worker))
        .collect()
}

/// Placements for a new child, colocated with its parent's placements.
pub fn colocate(parent: &[ShardPlacement], child_id: &str) -> Vec<ShardPlacement> {
    parent
        .iter()
        .map(|p| ShardPlacement::new(child_id, p.shard_index, &p.worker))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(names: &[&str]) -> Vec<WorkerId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn round_robin_cycles_through_workers() {
        let assignment = assign_shards(5, &workers(&["w1", "w2"]));
        let owners: Vec<&str> = assignment.iter().map(|(_, w)| w.as_str()).collect();
        assert_eq!(owners, vec!["w1", "w2", "w1", "w2", "w1"]);
    }

    #[test]
    fn no_workers_no_shards() {
        assert!(assign_shards(4, &[]).is_empty());
    }

    #[test]
    fn children_are_colocated() {
        let parent = placements_for_node("events", &assign_shards(3, &workers(&["w1", "w2"])));
        let child = colocate(&parent, "events_2024");

        assert_eq!(child.len(), 3);
        for (p, c) in parent.iter().zip(&child) {
            assert_eq!(p.shard_index, c.shard_index);
            assert_eq!(p.worker, c.worker);
            assert_eq!(c.node_id, "events_2024");
        }
        assert_eq!(child[2].relation, "events_2024:2");
    }
}
