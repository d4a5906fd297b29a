//! Propagation coordinator — applies a delta set and reports every target.
//!
//! Application order:
//! 1. Deltas on the primary node, in order, under its node lock, in a
//!    task of their own. Any failure there, including a panicking
//!    backend, skips every remaining delta.
//! 2. All other deltas, grouped per node. Each group is one task in a
//!    [`JoinSet`] holding that node's lock; groups run concurrently and
//!    are all joined before the result is built. A failing group never
//!    cancels its siblings.
//!
//! Each apply call is bounded by a timeout and preceded by a `describe`
//! so re-applying an already-present value is a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{debug, info, warn};

use shardline_catalog::NodeId;

use crate::apply::{ApplyError, ApplyService};
use crate::delta::{Delta, DeltaSet, MetadataChange, Operation};
use crate::locks::NodeLocks;
use crate::resolver::Target;

/// Why a target was not attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A delta on the operation's primary node failed.
    PrimaryFailed { node: NodeId },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::PrimaryFailed { node } => write!(f, "primary node {node} failed"),
        }
    }
}

/// Outcome of one delta on one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TargetOutcome {
    Applied,
    Failed(ApplyError),
    Skipped(SkipReason),
}

impl TargetOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TargetOutcome::Applied)
    }
}

/// One line of the aggregate report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub target: Target,
    pub change: MetadataChange,
    pub outcome: TargetOutcome,
}

/// Per-target outcomes of a delta set, in delta order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub operation: Operation,
    pub primary: NodeId,
    pub targets: Vec<TargetReport>,
}

impl AggregateResult {
    pub fn applied(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|r| r.outcome.is_applied())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets
            .iter()
            .filter(|r| matches!(r.outcome, TargetOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets
            .iter()
            .filter(|r| matches!(r.outcome, TargetOutcome::Skipped(_)))
    }

    /// Every target applied.
    pub fn is_success(&self) -> bool {
        self.targets.iter().all(|r| r.outcome.is_applied())
    }

    /// A delta on the primary node failed, so nothing else was attempted.
    pub fn primary_failed(&self) -> bool {
        self.targets.iter().any(|r| {
            r.target.node_id == self.primary && matches!(r.outcome, TargetOutcome::Failed(_))
        })
    }

    /// Reports for the targets of one node.
    pub fn for_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a TargetReport> {
        self.targets.iter().filter(move |r| r.target.node_id == node_id)
    }

    /// Whether `change` reached every target of `node_id` it was sent to.
    ///
    /// False when no such delta was part of the set.
    pub fn applied_everywhere(&self, node_id: &str, change: &MetadataChange) -> bool {
        let mut matching = self.for_node(node_id).filter(|r| &r.change == change).peekable();
        matching.peek().is_some() && matching.all(|r| r.outcome.is_applied())
    }

    /// Nodes appearing in the report, in first-appearance order.
    pub fn nodes(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for report in &self.targets {
            if !seen.contains(&report.target.node_id.as_str()) {
                seen.push(&report.target.node_id);
            }
        }
        seen
    }
}

/// Executes delta sets against an [`ApplyService`].
#[derive(Clone)]
pub struct Coordinator {
    backend: Arc<dyn ApplyService>,
    locks: NodeLocks,
    timeout: Duration,
}

impl Coordinator {
    pub fn new(backend: Arc<dyn ApplyService>, locks: NodeLocks, timeout: Duration) -> Self {
        Self {
            backend,
            locks,
            timeout,
        }
    }

    /// Apply `delta_set` and report every target's outcome.
    pub async fn apply(&self, delta_set: DeltaSet) -> AggregateResult {
        let DeltaSet {
            operation,
            primary,
            deltas,
        } = delta_set;
        info!(%operation, %primary, deltas = deltas.len(), "propagating delta set");

        let mut outcomes: Vec<Option<TargetOutcome>> = vec![None; deltas.len()];
        let (primary_items, rest): (Vec<_>, Vec<_>) = deltas
            .iter()
            .cloned()
            .enumerate()
            .partition(|(_, d)| d.target.node_id == primary);

        // Primary node first; its failure is fatal to the whole set.
        let primary_indexes: Vec<usize> = primary_items.iter().map(|(idx, _)| *idx).collect();
        let primary_task = tokio::spawn(run_node_group(
            Arc::clone(&self.backend),
            self.locks.clone(),
            self.timeout,
            primary.clone(),
            primary_items,
        ));
        let primary_outcomes = match primary_task.await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                warn!(%operation, %primary, error = %err, "primary apply task did not complete");
                primary_indexes
                    .into_iter()
                    .map(|idx| (idx, task_failed(&err)))
                    .collect()
            }
        };
        let primary_ok = primary_outcomes.iter().all(|(_, o)| o.is_applied());
        for (idx, outcome) in primary_outcomes {
            outcomes[idx] = Some(outcome);
        }

        if primary_ok {
            self.fan_out(rest, &mut outcomes).await;
        } else {
            warn!(%operation, %primary, skipped = rest.len(), "primary node failed, skipping remaining targets");
            for (idx, _) in rest {
                outcomes[idx] = Some(TargetOutcome::Skipped(SkipReason::PrimaryFailed {
                    node: primary.clone(),
                }));
            }
        }

        let targets: Vec<TargetReport> = deltas
            .into_iter()
            .zip(outcomes)
            .map(|(delta, outcome)| TargetReport {
                target: delta.target,
                change: delta.change,
                // Every index is filled by the primary pass, the fan-out or the skip.
                outcome: outcome.unwrap_or(TargetOutcome::Failed(ApplyError::Backend {
                    reason: "no outcome recorded".to_string(),
                })),
            })
            .collect();

        let result = AggregateResult {
            operation,
            primary,
            targets,
        };
        info!(
            operation = %result.operation,
            primary = %result.primary,
            applied = result.applied().count(),
            failed = result.failed().count(),
            skipped = result.skipped().count(),
            "delta set propagated"
        );
        result
    }

    /// Scatter the non-primary deltas per node, then gather every outcome.
    async fn fan_out(
        &self,
        items: Vec<(usize, Delta)>,
        outcomes: &mut [Option<TargetOutcome>],
    ) {
        let mut groups: Vec<(NodeId, Vec<(usize, Delta)>)> = Vec::new();
        for (idx, delta) in items {
            match groups.iter_mut().find(|(node, _)| *node == delta.target.node_id) {
                Some((_, group)) => group.push((idx, delta)),
                None => groups.push((delta.target.node_id.clone(), vec![(idx, delta)])),
            }
        }

        let mut tasks = JoinSet::new();
        let mut task_indexes: HashMap<TaskId, Vec<usize>> = HashMap::new();
        for (node_id, group) in groups {
            let indexes = group.iter().map(|(idx, _)| *idx).collect();
            let handle = tasks.spawn(run_node_group(
                Arc::clone(&self.backend),
                self.locks.clone(),
                self.timeout,
                node_id,
                group,
            ));
            task_indexes.insert(handle.id(), indexes);
        }

        // Join barrier: wait for every group, no early cancellation.
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, group_outcomes)) => {
                    for (idx, outcome) in group_outcomes {
                        outcomes[idx] = Some(outcome);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "apply task did not complete");
                    for idx in task_indexes.remove(&err.id()).unwrap_or_default() {
                        outcomes[idx] = Some(task_failed(&err));
                    }
                }
            }
        }
    }
}

fn task_failed(err: &JoinError) -> TargetOutcome {
    TargetOutcome::Failed(ApplyError::Backend {
        reason: format!("apply task did not complete: {err}"),
    })
}

/// Apply one node's deltas in order while holding its lock.
async fn run_node_group(
    backend: Arc<dyn ApplyService>,
    locks: NodeLocks,
    timeout: Duration,
    node_id: NodeId,
    items: Vec<(usize, Delta)>,
) -> Vec<(usize, TargetOutcome)> {
    if items.is_empty() {
        return Vec::new();
    }
    let _guard = locks.lock(&node_id).await;
    let mut results = Vec::with_capacity(items.len());
    for (idx, delta) in items {
        let outcome = apply_one(backend.as_ref(), &delta, timeout).await;
        if let TargetOutcome::Failed(err) = &outcome {
            warn!(relation = %delta.target, change = %delta.change, error = %err, "apply failed");
        }
        results.push((idx, outcome));
    }
    results
}

async fn apply_one(backend: &dyn ApplyService, delta: &Delta, timeout: Duration) -> TargetOutcome {
    match tokio::time::timeout(timeout, apply_change(backend, delta)).await {
        Ok(Ok(())) => TargetOutcome::Applied,
        Ok(Err(err)) => TargetOutcome::Failed(err),
        Err(_) => TargetOutcome::Failed(ApplyError::Timeout {
            millis: timeout.as_millis() as u64,
        }),
    }
}

/// Compare current against desired, then mutate only if they differ.
async fn apply_change(backend: &dyn ApplyService, delta: &Delta) -> Result<(), ApplyError> {
    let current = backend.describe(&delta.target).await?;
    if current.already_has(&delta.change)? {
        debug!(relation = %delta.target, change = %delta.change, "already applied");
        return Ok(());
    }
    match &delta.change {
        MetadataChange::AccessMethod(method) => {
            backend.apply_access_method(&delta.target, method).await?
        }
        MetadataChange::IdentitySpec(spec) => backend.apply_identity_spec(&delta.target, spec).await?,
        MetadataChange::ExclusionRule(rule) => {
            backend.apply_exclusion_rule(&delta.target, rule).await?
        }
    }
    debug!(relation = %delta.target, change = %delta.change, "applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{ApplyFuture, PhysicalState};
    use crate::memory::MemoryBackend;
    use shardline_catalog::{AccessMethod, ComparisonOp, ExclusionRule, IdentitySpec, Row};

    /// Backend that panics when describing one node, delegating otherwise.
    struct PanicOn {
        node: &'static str,
        inner: MemoryBackend,
    }

    impl ApplyService for PanicOn {
        fn describe<'a>(&'a self, target: &'a Target) -> ApplyFuture<'a, PhysicalState> {
            if target.node_id == self.node {
                panic!("backend crashed on {}", self.node);
            }
            self.inner.describe(target)
        }

        fn apply_access_method<'a>(
            &'a self,
            target: &'a Target,
            method: &'a AccessMethod,
        ) -> ApplyFuture<'a, ()> {
            self.inner.apply_access_method(target, method)
        }

        fn apply_identity_spec<'a>(
            &'a self,
            target: &'a Target,
            spec: &'a IdentitySpec,
        ) -> ApplyFuture<'a, ()> {
            self.inner.apply_identity_spec(target, spec)
        }

        fn apply_exclusion_rule<'a>(
            &'a self,
            target: &'a Target,
            rule: &'a ExclusionRule,
        ) -> ApplyFuture<'a, ()> {
            self.inner.apply_exclusion_rule(target, rule)
        }
    }

    fn panicking(node: &'static str, inner: &MemoryBackend) -> Coordinator {
        let backend = PanicOn {
            node,
            inner: inner.clone(),
        };
        Coordinator::new(Arc::new(backend), NodeLocks::new(), Duration::from_secs(1))
    }

    fn alter_set() -> DeltaSet {
        let mut set = DeltaSet::new(Operation::AlterExistingChildren, "events");
        set.push(Target::local("events"), method("columnar"));
        set.push(Target::local("p_a"), method("columnar"));
        set.push(Target::local("p_b"), method("columnar"));
        set
    }

    fn coordinator(backend: &MemoryBackend, timeout: Duration) -> Coordinator {
        Coordinator::new(Arc::new(backend.clone()), NodeLocks::new(), timeout)
    }

    fn method(name: &str) -> MetadataChange {
        MetadataChange::AccessMethod(AccessMethod::new(name))
    }

    fn row(date: &str, id: i64) -> Row {
        Row::from([
            ("date".to_string(), date.into()),
            ("id".to_string(), id.into()),
        ])
    }

    #[tokio::test]
    async fn empty_set_is_success() {
        let backend = MemoryBackend::new();
        let result = coordinator(&backend, Duration::from_secs(1))
            .apply(DeltaSet::new(Operation::SetAccessMethod, "events"))
            .await;
        assert!(result.is_success());
        assert!(result.targets.is_empty());
    }

    #[tokio::test]
    async fn primary_failure_skips_everything_else() {
        let backend = MemoryBackend::new();
        backend
            .fail_relation(
                "events",
                ApplyError::Unreachable {
                    reason: "worker down".to_string(),
                },
            )
            .await;

        let mut set = DeltaSet::new(Operation::AlterExistingChildren, "events");
        set.push(Target::local("events"), method("columnar"));
        set.push(Target::local("p_a"), method("columnar"));
        set.push(Target::local("p_b"), method("columnar"));

        let result = coordinator(&backend, Duration::from_secs(1)).apply(set).await;

        assert!(result.primary_failed());
        assert_eq!(result.failed().count(), 1);
        assert_eq!(result.skipped().count(), 2);
        assert!(backend.state(&Target::local("p_a")).await.access_method.is_none());
    }

    #[tokio::test]
    async fn child_failure_does_not_abort_siblings() {
        let backend = MemoryBackend::new();
        backend
            .preload(&Target::local("p_b"), vec![row("d", 1), row("d", 1)])
            .await;
        let rule = ExclusionRule::new(
            "excl",
            vec![("date", ComparisonOp::Eq), ("id", ComparisonOp::Eq)],
        );

        let mut set = DeltaSet::new(Operation::AddExclusionRule, "events");
        set.push(Target::local("events"), MetadataChange::ExclusionRule(rule.clone()));
        for child in ["p_a", "p_b", "p_c"] {
            set.push(
                Target::local(child),
                MetadataChange::ExclusionRule(rule.mirrored_for(child)),
            );
        }

        let result = coordinator(&backend, Duration::from_secs(1)).apply(set).await;

        let outcomes: Vec<&TargetOutcome> = result.targets.iter().map(|r| &r.outcome).collect();
        assert_eq!(outcomes[0], &TargetOutcome::Applied);
        assert_eq!(outcomes[1], &TargetOutcome::Applied);
        assert!(matches!(
            outcomes[2],
            TargetOutcome::Failed(ApplyError::ExclusionViolation { rule, .. }) if rule == "p_b_excl"
        ));
        assert_eq!(outcomes[3], &TargetOutcome::Applied);
        assert!(!result.primary_failed());
    }

    #[tokio::test]
    async fn panicking_primary_fails_and_skips_the_rest() {
        let backend = MemoryBackend::new();
        let result = panicking("events", &backend).apply(alter_set()).await;

        assert!(result.primary_failed());
        assert!(matches!(
            &result.targets[0].outcome,
            TargetOutcome::Failed(ApplyError::Backend { reason })
                if reason.starts_with("apply task did not complete")
        ));
        assert_eq!(result.skipped().count(), 2);
        assert!(backend.state(&Target::local("p_a")).await.access_method.is_none());
    }

    #[tokio::test]
    async fn panicking_child_fails_alone() {
        let backend = MemoryBackend::new();
        let result = panicking("p_a", &backend).apply(alter_set()).await;

        assert!(!result.primary_failed());
        assert_eq!(result.targets[0].outcome, TargetOutcome::Applied);
        assert!(matches!(
            &result.targets[1].outcome,
            TargetOutcome::Failed(ApplyError::Backend { .. })
        ));
        assert_eq!(result.targets[2].outcome, TargetOutcome::Applied);
        assert_eq!(
            backend.state(&Target::local("p_b")).await.access_method,
            Some(AccessMethod::new("columnar"))
        );
    }

    #[tokio::test]
    async fn slow_target_times_out_alone() {
        let backend = MemoryBackend::new();
        backend.delay_relation("p_slow", Duration::from_millis(500)).await;

        let mut set = DeltaSet::new(Operation::AlterExistingChildren, "events");
        set.push(Target::local("p_fast"), method("columnar"));
        set.push(Target::local("p_slow"), method("columnar"));

        let result = coordinator(&backend, Duration::from_millis(50)).apply(set).await;

        assert_eq!(result.targets[0].outcome, TargetOutcome::Applied);
        assert_eq!(
            result.targets[1].outcome,
            TargetOutcome::Failed(ApplyError::Timeout { millis: 50 })
        );
    }

    #[tokio::test]
    async fn reapplying_is_a_noop() {
        let backend = MemoryBackend::new();
        let coordinator = coordinator(&backend, Duration::from_secs(1));
        let mut set = DeltaSet::new(Operation::SetAccessMethod, "events");
        set.push(Target::local("events"), method("columnar"));

        let first = coordinator.apply(set.clone()).await;
        let mutations = backend.mutation_count();
        let second = coordinator.apply(set).await;

        assert!(first.is_success());
        assert!(second.is_success());
        assert_eq!(backend.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn report_serializes_outcomes_with_reasons() {
        let backend = MemoryBackend::new();
        backend
            .fail_relation(
                "events",
                ApplyError::Unreachable {
                    reason: "down".to_string(),
                },
            )
            .await;
        let mut set = DeltaSet::new(Operation::SetAccessMethod, "events");
        set.push(Target::local("events"), method("columnar"));
        set.push(Target::local("p_a"), method("columnar"));

        let result = coordinator(&backend, Duration::from_secs(1)).apply(set).await;
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["operation"], "set_access_method");
        assert_eq!(json["targets"][0]["outcome"]["status"], "failed");
        assert_eq!(json["targets"][0]["outcome"]["reason"]["kind"], "unreachable");
        assert_eq!(json["targets"][1]["outcome"]["status"], "skipped");
        assert_eq!(json["targets"][1]["outcome"]["reason"]["node"], "events");
    }

    #[tokio::test]
    async fn applied_everywhere_requires_all_targets() {
        let backend = MemoryBackend::new();
        backend
            .fail_worker(
                "w2",
                ApplyError::Unreachable {
                    reason: "partitioned".to_string(),
                },
            )
            .await;
        let placements = crate::placement::placements_for_node(
            "p_a",
            &[(0, "w1".to_string()), (1, "w2".to_string())],
        );

        let mut set = DeltaSet::new(Operation::AlterExistingChildren, "events");
        for p in placements {
            set.push(Target::shard(p), method("columnar"));
        }

        let result = coordinator(&backend, Duration::from_secs(1)).apply(set).await;
        assert_eq!(result.applied().count(), 1);
        assert!(!result.applied_everywhere("p_a", &method("columnar")));
        assert!(!result.applied_everywhere("p_b", &method("columnar")));
        assert_eq!(result.nodes(), vec!["p_a"]);
    }
}
