//! In-process apply backend.
//!
//! Keeps one relation per physical target (local relation or shard
//! placement) with its access method, identity generator, installed
//! exclusion rules and rows. Used by the CLI and by tests, which also
//! use its fault injection to simulate unreachable or slow targets.
//!
//! Exclusion rules are enforced per relation: two rows in different
//! relations never conflict. Relations are keyed by `(worker, relation)`,
//! so a local relation never aliases a shard placement.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use shardline_catalog::{AccessMethod, Datum, ExclusionRule, IdentitySpec, Row};

use crate::apply::{ApplyError, ApplyFuture, ApplyService, PhysicalState};
use crate::resolver::Target;

/// Identity generator of one relation. The cursor is private to it.
#[derive(Debug, Clone)]
struct IdentityCursor {
    spec: IdentitySpec,
    next: i64,
}

#[derive(Debug, Default)]
struct Relation {
    access_method: Option<AccessMethod>,
    identity: Option<IdentityCursor>,
    rules: Vec<ExclusionRule>,
    rows: Vec<Row>,
}

impl Relation {
    fn physical_state(&self) -> PhysicalState {
        PhysicalState {
            access_method: self.access_method.clone(),
            identity: self.identity.as_ref().map(|c| c.spec.clone()),
            rules: self.rules.clone(),
        }
    }

    /// First rule that `row` would violate against the stored rows.
    fn violation(&self, row: &Row) -> Option<ApplyError> {
        self.rules.iter().find_map(|rule| {
            self.rows
                .iter()
                .any(|existing| rule.conflicts(existing, row))
                .then(|| ApplyError::ExclusionViolation {
                    rule: rule.name.clone(),
                    key: rule.key_of(row),
                })
        })
    }
}

/// Worker (`None` for local relations) and relation name.
type RelationKey = (Option<String>, String);

fn relation_key(target: &Target) -> RelationKey {
    (
        target.worker().map(str::to_string),
        target.relation().to_string(),
    )
}

/// First value `spec` may hand out on a relation that already holds
/// generated values: past every stored value and past whatever the
/// previous generator issued, in the direction of `spec.increment`.
fn resume_cursor(previous: Option<&IdentityCursor>, spec: &IdentitySpec, rows: &[Row]) -> i64 {
    match previous {
        Some(prev) if prev.spec == *spec => return prev.next,
        _ => {}
    }
    let last_issued = previous
        .filter(|prev| prev.next != prev.spec.start)
        .map(|prev| prev.next.saturating_sub(prev.spec.increment));
    let values = rows
        .iter()
        .filter_map(|row| match row.get(&spec.column) {
            Some(Datum::Int(v)) => Some(*v),
            _ => None,
        })
        .chain(last_issued);
    let edge = if spec.increment > 0 {
        values.max()
    } else {
        values.min()
    };
    match edge {
        Some(edge) if spec.increment > 0 => edge.saturating_add(spec.increment).max(spec.start),
        Some(edge) => edge.saturating_add(spec.increment).min(spec.start),
        None => spec.start,
    }
}

#[derive(Debug, Clone)]
enum Fault {
    Fail(ApplyError),
    Delay(Duration),
}

/// Thread-safe in-memory apply backend. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    relations: Arc<Mutex<HashMap<RelationKey, Relation>>>,
    relation_faults: Arc<Mutex<HashMap<String, Fault>>>,
    worker_faults: Arc<Mutex<HashMap<String, Fault>>>,
    mutations: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Make every call against `relation` fail with `err`.
    pub async fn fail_relation(&self, relation: &str, err: ApplyError) {
        self.relation_faults
            .lock()
            .await
            .insert(relation.to_string(), Fault::Fail(err));
    }

    /// Make every call against relations on `worker` fail with `err`.
    pub async fn fail_worker(&self, worker: &str, err: ApplyError) {
        self.worker_faults
            .lock()
            .await
            .insert(worker.to_string(), Fault::Fail(err));
    }

    /// Delay every call against `relation` by `delay`.
    pub async fn delay_relation(&self, relation: &str, delay: Duration) {
        self.relation_faults
            .lock()
            .await
            .insert(relation.to_string(), Fault::Delay(delay));
    }

    pub async fn clear_faults(&self) {
        self.relation_faults.lock().await.clear();
        self.worker_faults.lock().await.clear();
    }

    async fn check_faults(&self, target: &Target) -> Result<(), ApplyError> {
        let fault = {
            let by_relation = self.relation_faults.lock().await;
            match by_relation.get(target.relation()) {
                Some(fault) => Some(fault.clone()),
                None => match target.worker() {
                    Some(worker) => self.worker_faults.lock().await.get(worker).cloned(),
                    None => None,
                },
            }
        };
        match fault {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ── Rows ───────────────────────────────────────────────────────

    /// Store rows as pre-existing data, without enforcing any rule.
    pub async fn preload(&self, target: &Target, rows: Vec<Row>) {
        let mut relations = self.relations.lock().await;
        let relation = relations.entry(relation_key(target)).or_default();
        relation.rows.extend(rows);
    }

    /// Insert a row, generating the identity value if the column is absent
    /// or NULL and enforcing the relation's exclusion rules.
    ///
    /// Returns the stored row.
    pub async fn insert(&self, target: &Target, mut row: Row) -> Result<Row, ApplyError> {
        self.check_faults(target).await?;
        let mut relations = self.relations.lock().await;
        let relation = relations.entry(relation_key(target)).or_default();

        let mut advanced: Option<i64> = None;
        if let Some(cursor) = &relation.identity {
            let column = &cursor.spec.column;
            if matches!(row.get(column), None | Some(Datum::Null)) {
                row.insert(column.clone(), Datum::Int(cursor.next));
                advanced = Some(cursor.next + cursor.spec.increment);
            }
        }

        if let Some(err) = relation.violation(&row) {
            debug!(relation = %target, error = %err, "insert rejected");
            return Err(err);
        }

        if let (Some(next), Some(cursor)) = (advanced, relation.identity.as_mut()) {
            cursor.next = next;
        }
        relation.rows.push(row.clone());
        Ok(row)
    }

    pub async fn rows(&self, target: &Target) -> Vec<Row> {
        self.relations
            .lock()
            .await
            .get(&relation_key(target))
            .map(|r| r.rows.clone())
            .unwrap_or_default()
    }

    /// Metadata present on `target` (empty if it was never touched).
    pub async fn state(&self, target: &Target) -> PhysicalState {
        self.relations
            .lock()
            .await
            .get(&relation_key(target))
            .map(Relation::physical_state)
            .unwrap_or_default()
    }

    /// Next value the target's identity generator will hand out.
    pub async fn identity_cursor(&self, target: &Target) -> Option<i64> {
        self.relations
            .lock()
            .await
            .get(&relation_key(target))
            .and_then(|r| r.identity.as_ref().map(|c| c.next))
    }

    /// Number of metadata mutations performed so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }
}

impl ApplyService for MemoryBackend {
    fn describe<'a>(&'a self, target: &'a Target) -> ApplyFuture<'a, PhysicalState> {
        Box::pin(async move {
            self.check_faults(target).await?;
            Ok(self.state(target).await)
        })
    }

    fn apply_access_method<'a>(
        &'a self,
        target: &'a Target,
        method: &'a AccessMethod,
    ) -> ApplyFuture<'a, ()> {
        Box::pin(async move {
            self.check_faults(target).await?;
            let mut relations = self.relations.lock().await;
            let relation = relations.entry(relation_key(target)).or_default();
            relation.access_method = Some(method.clone());
            self.record_mutation();
            debug!(relation = %target, %method, "access method set");
            Ok(())
        })
    }

    fn apply_identity_spec<'a>(
        &'a self,
        target: &'a Target,
        spec: &'a IdentitySpec,
    ) -> ApplyFuture<'a, ()> {
        Box::pin(async move {
            self.check_faults(target).await?;
            let mut relations = self.relations.lock().await;
            let relation = relations.entry(relation_key(target)).or_default();
            let next = resume_cursor(relation.identity.as_ref(), spec, &relation.rows);
            relation.identity = Some(IdentityCursor {
                spec: spec.clone(),
                next,
            });
            self.record_mutation();
            debug!(relation = %target, column = %spec.column, start = spec.start, next, "identity generator set");
            Ok(())
        })
    }

    fn apply_exclusion_rule<'a>(
        &'a self,
        target: &'a Target,
        rule: &'a ExclusionRule,
    ) -> ApplyFuture<'a, ()> {
        Box::pin(async move {
            self.check_faults(target).await?;
            let mut relations = self.relations.lock().await;
            let relation = relations.entry(relation_key(target)).or_default();

            match relation.rules.iter().find(|r| r.name == rule.name) {
                Some(existing) if existing == rule => return Ok(()),
                Some(_) => {
                    return Err(ApplyError::NameConflict {
                        rule: rule.name.clone(),
                    });
                }
                None => {}
            }

            // Existing data must already satisfy the rule.
            for (i, a) in relation.rows.iter().enumerate() {
                if let Some(b) = relation.rows[i + 1..].iter().find(|b| rule.conflicts(a, b)) {
                    return Err(ApplyError::ExclusionViolation {
                        rule: rule.name.clone(),
                        key: rule.key_of(b),
                    });
                }
            }

            relation.rules.push(rule.clone());
            self.record_mutation();
            debug!(relation = %target, rule = %rule.name, "exclusion rule installed");
            Ok(())
        })
    }
}
