//! DDL entry points.
//!
//! Each operation validates first, writes the node records it needs,
//! hands a delta set to the [`Coordinator`] and then records in the
//! catalog whatever every target of a node actually applied.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use shardline_catalog::{
    CatalogError, CatalogStore, ColumnDef, Distribution, ExclusionRule, IdentitySpec, NodeId,
    PartitionBounds, TableNode, WorkerId,
};
use shardline_core::{EngineConfig, validate_identifier};

use crate::apply::ApplyService;
use crate::coordinator::{AggregateResult, Coordinator};
use crate::delta::{DeltaSet, MetadataChange, Operation};
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::inheritance::{self, ExclusionScope};
use crate::locks::NodeLocks;
use crate::placement;
use crate::resolver::{self, ResolvedNode, Target};

/// A new root partitioned table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSpec {
    pub id: NodeId,
    pub columns: Vec<ColumnDef>,
    /// Registered method; the configured default when `None`.
    pub access_method: Option<String>,
    pub identity: Option<IdentitySpec>,
    pub partition_key: Vec<String>,
}

/// Explicit generator parameters for a created child. The column is
/// always the parent's identity column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityOverride {
    pub start: i64,
    pub increment: i64,
}

/// How a child comes into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildSource {
    /// A new partition with the parent's columns.
    Create { identity: Option<IdentityOverride> },
    /// A pre-existing table bound as a partition.
    Attach {
        columns: Vec<ColumnDef>,
        /// The table's own generated identity column, if it has one.
        identity: Option<IdentitySpec>,
        /// Allow turning a plain column into the parent's identity column.
        convert_identity: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub id: NodeId,
    pub bounds: Option<PartitionBounds>,
    pub source: ChildSource,
}

/// Parameters of `distribute`. Empty `workers` and a missing
/// `shard_count` fall back to the engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributeRequest {
    pub column: String,
    pub shard_count: Option<u32>,
    pub workers: Vec<WorkerId>,
}

/// The propagation engine.
#[derive(Clone)]
pub struct Engine {
    catalog: CatalogStore,
    coordinator: Coordinator,
    locks: NodeLocks,
    config: EngineConfig,
}

impl Engine {
    pub fn new(catalog: CatalogStore, backend: Arc<dyn ApplyService>, config: EngineConfig) -> Self {
        let locks = NodeLocks::new();
        let coordinator = Coordinator::new(backend, locks.clone(), config.apply_timeout());
        Self {
            catalog,
            coordinator,
            locks,
            config,
        }
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// See [`resolver::resolve`].
    pub fn resolve(&self, root_id: &str) -> EngineResult<Vec<ResolvedNode>> {
        resolver::resolve(&self.catalog, root_id)
    }

    /// Create a root table and apply its access method and identity spec
    /// to its local relation.
    pub async fn create_root(&self, spec: RootSpec) -> EngineResult<AggregateResult> {
        let node = inheritance::root_node(&self.config, &spec)?;
        let node = self.insert(&node)?;
        info!(node = %node.id, method = %node.access_method, "root created");

        let mut set = DeltaSet::new(Operation::CreateRoot, &node.id);
        inheritance::node_deltas(&mut set, &node, &[Target::local(&node.id)]);
        self.apply(set).await
    }

    /// Change the access method of `root_id` itself. Existing children
    /// keep theirs; only children created or attached later inherit it.
    pub async fn set_access_method(
        &self,
        root_id: &str,
        method: &str,
    ) -> EngineResult<AggregateResult> {
        let method = inheritance::validate_access_method(&self.config, method)?;
        let resolved = self.resolve(root_id)?;

        let mut set = DeltaSet::new(Operation::SetAccessMethod, root_id);
        for target in resolved[0].targets() {
            set.push(target, MetadataChange::AccessMethod(method.clone()));
        }
        info!(node = %root_id, %method, "setting access method");
        self.apply(set).await
    }

    /// Create a partition under `parent_id`, or attach an existing table
    /// as one, inheriting a snapshot of the parent's metadata.
    pub async fn create_or_attach_child(
        &self,
        parent_id: &str,
        spec: ChildSpec,
    ) -> EngineResult<AggregateResult> {
        let parent = self
            .catalog
            .get_node(parent_id)?
            .ok_or_else(|| EngineError::UnknownTarget(parent_id.to_string()))?;
        let operation = match spec.source {
            ChildSource::Create { .. } => Operation::CreateChild,
            ChildSource::Attach { .. } => Operation::AttachChild,
        };
        let inherited = inheritance::inherit_child(&parent, &spec)?;

        // Rules enter the record once they are installed.
        let mut record = inherited.clone();
        record.rules.clear();
        let child = self.insert(&record)?;

        let placements = placement::colocate(&self.catalog.placements_for(parent_id)?, &child.id);
        if !placements.is_empty() {
            self.catalog.put_placements(&placements)?;
        }
        info!(
            %operation,
            node = %child.id,
            parent = %parent_id,
            method = %child.access_method,
            rules = inherited.rules.len(),
            shards = placements.len(),
            "child registered"
        );

        let resolved = ResolvedNode {
            node: inherited,
            placements,
        };
        let mut set = DeltaSet::new(operation, &child.id);
        inheritance::node_deltas(&mut set, &resolved.node, &resolved.targets());
        self.apply(set).await
    }

    /// Install `rule` on `root_id` and mirror it onto every descendant.
    ///
    /// Each target installs independently; a child whose rows already
    /// violate the rule is reported without undoing the others.
    pub async fn add_exclusion_rule(
        &self,
        root_id: &str,
        rule: ExclusionRule,
    ) -> EngineResult<AggregateResult> {
        let resolved = self.resolve(root_id)?;
        let rule = inheritance::validate_rule(&resolved[0].node, &rule)?;
        inheritance::validate_mirrors(&resolved, &rule)?;

        let mut set = DeltaSet::new(Operation::AddExclusionRule, root_id);
        inheritance::rule_deltas(&mut set, &resolved, &rule);
        info!(node = %root_id, rule = %rule.name, nodes = resolved.len(), "adding exclusion rule");
        self.apply(set).await
    }

    /// Split `root_id` and all its descendants into colocated shard
    /// placements, then push every node's metadata to its placements.
    pub async fn distribute(
        &self,
        root_id: &str,
        request: DistributeRequest,
    ) -> EngineResult<AggregateResult> {
        let resolved = self.resolve(root_id)?;
        let root = &resolved[0].node;
        if !root.is_root() {
            return Err(ValidationError::InvalidDistribution(format!(
                "{root_id} is a partition; distribute its root"
            ))
            .into());
        }
        if root.is_distributed() {
            return Err(ValidationError::AlreadyDistributed(root_id.to_string()).into());
        }
        validate_identifier(&request.column).map_err(ValidationError::from)?;
        if root.column(&request.column).is_none() {
            return Err(ValidationError::InvalidDistribution(format!(
                "column {} does not exist on {root_id}",
                request.column
            ))
            .into());
        }
        let workers = if request.workers.is_empty() {
            self.config.workers.clone()
        } else {
            request.workers
        };
        if workers.is_empty() {
            return Err(ValidationError::InvalidDistribution("no workers given".to_string()).into());
        }
        let shard_count = request.shard_count.unwrap_or(self.config.default_shard_count);
        if shard_count == 0 {
            return Err(ValidationError::InvalidDistribution(
                "shard count must be greater than zero".to_string(),
            )
            .into());
        }

        let assignment = placement::assign_shards(shard_count, &workers);
        let distribution = Distribution {
            column: request.column,
            shard_count,
        };
        for member in &resolved {
            let id = &member.node.id;
            self.update_node(id, |n| n.distribution = Some(distribution.clone()))
                .await?;
            self.catalog
                .put_placements(&placement::placements_for_node(id, &assignment))?;
        }
        info!(
            node = %root_id,
            column = %distribution.column,
            shard_count,
            workers = workers.len(),
            nodes = resolved.len(),
            "placements created"
        );

        let mut set = DeltaSet::new(Operation::Distribute, root_id);
        for member in self.resolve(root_id)? {
            inheritance::node_deltas(&mut set, &member.node, &member.targets());
        }
        self.apply(set).await
    }

    /// Remove a partition, its descendants and their placements from the
    /// catalog. Physical relations are left as they are.
    ///
    /// Returns the detached node ids, the partition first.
    pub async fn detach_child(&self, child_id: &str) -> EngineResult<Vec<NodeId>> {
        let resolved = self.resolve(child_id).map_err(|err| match err {
            EngineError::UnknownRoot(id) => EngineError::UnknownTarget(id),
            other => other,
        })?;
        if resolved[0].node.is_root() {
            return Err(ValidationError::NotAPartition(child_id.to_string()).into());
        }

        for member in resolved.iter().rev() {
            let id = &member.node.id;
            let guard = self.locks.lock(id).await;
            self.catalog.remove_node(id)?;
            drop(guard);
            self.locks.forget(id).await;
        }
        let detached: Vec<NodeId> = resolved.into_iter().map(|m| m.node.id).collect();
        info!(node = %child_id, detached = detached.len(), "partition detached");
        Ok(detached)
    }

    /// Push the current access method of `root_id` to every existing
    /// descendant.
    pub async fn alter_existing_children(&self, root_id: &str) -> EngineResult<AggregateResult> {
        let resolved = self.resolve(root_id)?;
        let method = resolved[0].node.access_method.clone();

        let mut set = DeltaSet::new(Operation::AlterExistingChildren, root_id);
        inheritance::descendant_method_deltas(&mut set, &resolved, &method);
        info!(node = %root_id, %method, children = resolved.len() - 1, "altering existing children");
        self.apply(set).await
    }

    /// Whether the rule named `rule_name` on `node_id` holds across the
    /// whole table or only within each partition.
    pub fn exclusion_scope(&self, node_id: &str, rule_name: &str) -> EngineResult<ExclusionScope> {
        let node = self
            .catalog
            .get_node(node_id)?
            .ok_or_else(|| EngineError::UnknownRoot(node_id.to_string()))?;
        let rule = node.rule(rule_name).ok_or_else(|| EngineError::UnknownRule {
            node: node_id.to_string(),
            rule: rule_name.to_string(),
        })?;
        let root = self.root_of(&node)?;
        Ok(inheritance::exclusion_scope(&root, rule))
    }

    /// Apply a delta set and record what it applied.
    ///
    /// Also the way to resubmit: every delta is idempotent per target.
    pub async fn apply(&self, set: DeltaSet) -> EngineResult<AggregateResult> {
        let result = self.coordinator.apply(set).await;
        self.record_applied(&result).await?;
        Ok(result)
    }

    /// Re-apply every delta of `previous` that did not apply.
    pub async fn resubmit(&self, previous: &AggregateResult) -> EngineResult<AggregateResult> {
        let mut set = DeltaSet::new(previous.operation, &previous.primary);
        for report in previous.targets.iter().filter(|r| !r.outcome.is_applied()) {
            set.push(report.target.clone(), report.change.clone());
        }
        info!(operation = %previous.operation, deltas = set.len(), "resubmitting");
        self.apply(set).await
    }

    /// Write each change that reached every target of its node into that
    /// node's record.
    async fn record_applied(&self, result: &AggregateResult) -> EngineResult<()> {
        for node_id in result.nodes() {
            let mut changes: Vec<&MetadataChange> = Vec::new();
            for report in result.for_node(node_id) {
                if !changes.contains(&&report.change)
                    && result.applied_everywhere(node_id, &report.change)
                {
                    changes.push(&report.change);
                }
            }
            if changes.is_empty() {
                continue;
            }

            self.update_node(node_id, |node| {
                for change in changes {
                    match change {
                        MetadataChange::AccessMethod(m) => node.access_method = m.clone(),
                        MetadataChange::IdentitySpec(s) => node.identity = Some(s.clone()),
                        MetadataChange::ExclusionRule(r) => {
                            if !node.install_rule(r.clone()) {
                                warn!(node = %node.id, rule = %r.name, "rule name taken by a different rule, not recorded");
                            }
                        }
                    }
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Read-modify-write of one node record under its lock. A node that
    /// no longer exists is skipped.
    async fn update_node(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut TableNode),
    ) -> EngineResult<Option<TableNode>> {
        let _guard = self.locks.lock(node_id).await;
        let Some(mut node) = self.catalog.get_node(node_id)? else {
            debug!(node = %node_id, "node vanished before its record was updated");
            return Ok(None);
        };
        let before = node.clone();
        f(&mut node);
        if node == before {
            return Ok(Some(node));
        }
        Ok(Some(self.catalog.put_node(&node)?))
    }

    fn insert(&self, node: &TableNode) -> EngineResult<TableNode> {
        match self.catalog.insert_node(node) {
            Ok(stored) => Ok(stored),
            Err(CatalogError::AlreadyExists(_)) => {
                Err(ValidationError::DuplicateNode(node.id.clone()).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn root_of(&self, node: &TableNode) -> EngineResult<TableNode> {
        let mut current = node.clone();
        while let Some(parent_id) = current.parent.clone() {
            current = self
                .catalog
                .get_node(&parent_id)?
                .ok_or(EngineError::UnknownTarget(parent_id))?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use shardline_catalog::ColumnType;

    fn engine() -> (Engine, MemoryBackend) {
        let backend = MemoryBackend::new();
        let engine = Engine::new(
            CatalogStore::open_in_memory().unwrap(),
            Arc::new(backend.clone()),
            EngineConfig::default(),
        );
        (engine, backend)
    }

    fn spec(id: &str) -> RootSpec {
        RootSpec {
            id: id.to_string(),
            columns: vec![
                ColumnDef::new("id", ColumnType::BigInt),
                ColumnDef::new("date", ColumnType::Date),
            ],
            access_method: None,
            identity: None,
            partition_key: vec!["date".to_string()],
        }
    }

    #[tokio::test]
    async fn duplicate_root_is_rejected() {
        let (engine, _) = engine();
        engine.create_root(spec("events")).await.unwrap();
        let err = engine.create_root(spec("events")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DuplicateNode(id)) if id == "events"
        ));
    }

    #[tokio::test]
    async fn unchanged_record_is_not_rewritten() {
        let (engine, _) = engine();
        engine.create_root(spec("events")).await.unwrap();
        let version = engine.catalog().version().unwrap();

        engine.set_access_method("events", "heap").await.unwrap();
        assert_eq!(engine.catalog().version().unwrap(), version);
    }

    #[tokio::test]
    async fn failed_root_apply_keeps_recorded_method() {
        let (engine, backend) = engine();
        engine.create_root(spec("events")).await.unwrap();
        backend
            .fail_relation(
                "events",
                crate::ApplyError::Unreachable {
                    reason: "down".to_string(),
                },
            )
            .await;

        let result = engine.set_access_method("events", "columnar").await.unwrap();
        assert!(result.primary_failed());
        let root = engine.catalog().get_node("events").unwrap().unwrap();
        assert_eq!(root.access_method.as_str(), "heap");

        backend.clear_faults().await;
        let retried = engine.resubmit(&result).await.unwrap();
        assert!(retried.is_success());
        let root = engine.catalog().get_node("events").unwrap().unwrap();
        assert_eq!(root.access_method.as_str(), "columnar");
    }

    #[tokio::test]
    async fn unknown_parent_is_an_unknown_target() {
        let (engine, _) = engine();
        let err = engine
            .create_or_attach_child(
                "missing",
                ChildSpec {
                    id: "c1".to_string(),
                    bounds: None,
                    source: ChildSource::Create { identity: None },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTarget(id) if id == "missing"));
    }
}
