//! Domain types for the catalog store.
//!
//! These types describe the shape of a partitioned table: the node tree,
//! the metadata each node carries, and the shard placements of
//! distributed nodes. All types are serializable to/from JSON for storage
//! in redb tables.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a table node (the root or one partition).
pub type NodeId = String;

/// Identifier of a worker location holding shard placements.
pub type WorkerId = String;

// ── Access method ─────────────────────────────────────────────────

/// Physical storage strategy bound to a table node (e.g. `heap`, `columnar`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessMethod(String);

impl AccessMethod {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Columns ───────────────────────────────────────────────────────

/// Column data types known to the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Text,
    Date,
    Timestamp,
    Boolean,
    Jsonb,
}

impl ColumnType {
    /// Whether values of this type can be compared with `op`.
    pub fn supports(self, op: ComparisonOp) -> bool {
        match self {
            ColumnType::Jsonb => false,
            ColumnType::Boolean => matches!(op, ComparisonOp::Eq | ComparisonOp::Ne),
            _ => true,
        }
    }

    /// Whether an identity generator can back a column of this type.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt
        )
    }
}

impl std::str::FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smallint" | "int2" => Ok(ColumnType::SmallInt),
            "integer" | "int" | "int4" => Ok(ColumnType::Integer),
            "bigint" | "int8" => Ok(ColumnType::BigInt),
            "numeric" | "decimal" => Ok(ColumnType::Numeric),
            "text" | "varchar" => Ok(ColumnType::Text),
            "date" => Ok(ColumnType::Date),
            "timestamp" | "timestamptz" => Ok(ColumnType::Timestamp),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "jsonb" => Ok(ColumnType::Jsonb),
            other => Err(format!("unknown column type: {other}")),
        }
    }
}

/// A column of a table node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: &str, data_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
        }
    }
}

// ── Identity ──────────────────────────────────────────────────────

/// Generated-identity parameters of one column.
///
/// Only the parameters live in the catalog. The generator cursor belongs
/// to each physical copy and is never shared between nodes or shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySpec {
    pub column: String,
    pub start: i64,
    pub increment: i64,
}

impl IdentitySpec {
    pub fn new(column: &str, start: i64, increment: i64) -> Self {
        Self {
            column: column.to_string(),
            start,
            increment,
        }
    }
}

// ── Exclusion rules ───────────────────────────────────────────────

/// Comparison operator of one exclusion element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
        }
    }

    /// Evaluate `left op right`. Incomparable values (NULL, mixed types)
    /// never satisfy any operator.
    pub fn holds(self, left: &Datum, right: &Datum) -> bool {
        let Some(ord) = left.compare(right) else {
            return false;
        };
        match self {
            ComparisonOp::Eq => ord == Ordering::Equal,
            ComparisonOp::Ne => ord != Ordering::Equal,
            ComparisonOp::Lt => ord == Ordering::Less,
            ComparisonOp::Le => ord != Ordering::Greater,
            ComparisonOp::Gt => ord == Ordering::Greater,
            ComparisonOp::Ge => ord != Ordering::Less,
        }
    }
}

impl std::str::FromStr for ComparisonOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" | "eq" => Ok(ComparisonOp::Eq),
            "<>" | "!=" | "ne" => Ok(ComparisonOp::Ne),
            "<" | "lt" => Ok(ComparisonOp::Lt),
            "<=" | "le" => Ok(ComparisonOp::Le),
            ">" | "gt" => Ok(ComparisonOp::Gt),
            ">=" | "ge" => Ok(ComparisonOp::Ge),
            other => Err(format!("unknown comparison operator: {other}")),
        }
    }
}

/// One `(column, operator)` pair of an exclusion rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionElement {
    pub column: String,
    pub op: ComparisonOp,
}

/// A named exclusion constraint.
///
/// Two live rows conflict when every element's comparison holds between
/// them. On the root the rule's `name` equals its `base_name`; a mirrored
/// instance on a child is named `<child>_<base_name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub name: String,
    pub base_name: String,
    pub elements: Vec<ExclusionElement>,
}

impl ExclusionRule {
    /// Build a root-level rule.
    pub fn new(base_name: &str, elements: Vec<(&str, ComparisonOp)>) -> Self {
        Self {
            name: base_name.to_string(),
            base_name: base_name.to_string(),
            elements: elements
                .into_iter()
                .map(|(column, op)| ExclusionElement {
                    column: column.to_string(),
                    op,
                })
                .collect(),
        }
    }

    /// The instance of this rule installed on `child`.
    pub fn mirrored_for(&self, child: &str) -> Self {
        Self {
            name: mirrored_rule_name(child, &self.base_name),
            base_name: self.base_name.clone(),
            elements: self.elements.clone(),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.elements.iter().map(|e| e.column.as_str())
    }

    /// Columns compared with `=`.
    pub fn equality_columns(&self) -> impl Iterator<Item = &str> {
        self.elements
            .iter()
            .filter(|e| e.op == ComparisonOp::Eq)
            .map(|e| e.column.as_str())
    }

    /// Whether rows `a` and `b` conflict under this rule.
    pub fn conflicts(&self, a: &Row, b: &Row) -> bool {
        !self.elements.is_empty()
            && self.elements.iter().all(|e| {
                match (a.get(&e.column), b.get(&e.column)) {
                    (Some(l), Some(r)) => e.op.holds(l, r),
                    _ => false,
                }
            })
    }

    /// The tuple of constrained values of `row`, in element order.
    pub fn key_of(&self, row: &Row) -> Vec<(String, Datum)> {
        self.elements
            .iter()
            .map(|e| {
                (
                    e.column.clone(),
                    row.get(&e.column).cloned().unwrap_or(Datum::Null),
                )
            })
            .collect()
    }
}

/// Deterministic name of a rule mirrored onto a child.
pub fn mirrored_rule_name(child: &str, base_name: &str) -> String {
    format!("{child}_{base_name}")
}

// ── Rows ──────────────────────────────────────────────────────────

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Datum {
    /// SQL-style comparison: NULL compares to nothing, numbers compare
    /// across int/float, other mixed types are incomparable.
    pub fn compare(&self, other: &Datum) -> Option<Ordering> {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => None,
            (Datum::Bool(a), Datum::Bool(b)) => Some(a.cmp(b)),
            (Datum::Int(a), Datum::Int(b)) => Some(a.cmp(b)),
            (Datum::Int(a), Datum::Float(b)) => (*a as f64).partial_cmp(b),
            (Datum::Float(a), Datum::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Datum::Float(a), Datum::Float(b)) => a.partial_cmp(b),
            (Datum::Text(a), Datum::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Bool(b) => write!(f, "{b}"),
            Datum::Int(i) => write!(f, "{i}"),
            Datum::Float(x) => write!(f, "{x}"),
            Datum::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

/// A row keyed by column name.
pub type Row = BTreeMap<String, Datum>;

// ── Table nodes ───────────────────────────────────────────────────

/// Range of partition key values covered by a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBounds {
    /// Inclusive lower bound.
    pub from: String,
    /// Exclusive upper bound.
    pub to: String,
}

/// How a node is split into shard placements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    /// Column whose hash picks the shard.
    pub column: String,
    pub shard_count: u32,
}

/// The root partitioned table or one of its partitions.
///
/// Everything a node inherited from its parent was copied in at
/// creation/attach time; no field is read through the parent later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNode {
    pub id: NodeId,
    /// `None` for the root.
    pub parent: Option<NodeId>,
    /// `None` for the root.
    pub bounds: Option<PartitionBounds>,
    /// Unix timestamp (seconds) when this node was created or attached.
    pub created_at: u64,
    /// Catalog version at creation; orders siblings.
    pub seq: u64,
    /// Catalog version of the last write to this node.
    pub version: u64,
    pub columns: Vec<ColumnDef>,
    pub access_method: AccessMethod,
    pub identity: Option<IdentitySpec>,
    /// Installed exclusion rules, unique by name.
    pub rules: Vec<ExclusionRule>,
    /// Partition key columns (roots only; empty otherwise).
    pub partition_key: Vec<String>,
    pub distribution: Option<Distribution>,
}

impl TableNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_distributed(&self) -> bool {
        self.distribution.is_some()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn rule(&self, name: &str) -> Option<&ExclusionRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Install `rule`, replacing an identical one. Returns false when a
    /// different rule already holds the name.
    pub fn install_rule(&mut self, rule: ExclusionRule) -> bool {
        match self.rules.iter().find(|r| r.name == rule.name) {
            Some(existing) => *existing == rule,
            None => {
                self.rules.push(rule);
                true
            }
        }
    }
}

// ── Shard placements ──────────────────────────────────────────────

/// One physical copy of a node's data on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub node_id: NodeId,
    pub shard_index: u32,
    pub worker: WorkerId,
    /// Physical relation handle on the worker, `<node_id>:<shard_index>`.
    /// The `:` keeps it out of the identifier namespace, so no node id can
    /// name another node's shard.
    pub relation: String,
}

impl ShardPlacement {
    pub fn new(node_id: &str, shard_index: u32, worker: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            shard_index,
            worker: worker.to_string(),
            relation: format!("{node_id}:{shard_index}"),
        }
    }

    /// Build the composite key for the placements table.
    pub fn table_key(&self) -> String {
        placement_key(&self.node_id, self.shard_index)
    }
}

/// Composite key of a placement; zero-padded to the width of `u32::MAX`
/// so keys sort by shard index.
pub fn placement_key(node_id: &str, shard_index: u32) -> String {
    format!("{node_id}:{shard_index:010}")
}

/// Prefix shared by every placement key of `node_id`.
pub fn placement_prefix(node_id: &str) -> String {
    format!("{node_id}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Datum)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn mirrored_rule_is_named_after_child() {
        let rule = ExclusionRule::new(
            "excl",
            vec![("date", ComparisonOp::Eq), ("id", ComparisonOp::Eq)],
        );
        let mirrored = rule.mirrored_for("events_2024");

        assert_eq!(rule.name, "excl");
        assert_eq!(mirrored.name, "events_2024_excl");
        assert_eq!(mirrored.base_name, "excl");
        assert_eq!(mirrored.elements, rule.elements);
    }

    #[test]
    fn equality_rule_conflicts_only_on_full_match() {
        let rule = ExclusionRule::new(
            "excl",
            vec![("date", ComparisonOp::Eq), ("id", ComparisonOp::Eq)],
        );
        let a = row(&[("date", "2024-01-01".into()), ("id", 100.into())]);
        let b = row(&[("date", "2024-01-01".into()), ("id", 100.into())]);
        let c = row(&[("date", "2024-01-01".into()), ("id", 101.into())]);

        assert!(rule.conflicts(&a, &b));
        assert!(!rule.conflicts(&a, &c));
    }

    #[test]
    fn null_never_conflicts() {
        let rule = ExclusionRule::new("excl", vec![("id", ComparisonOp::Eq)]);
        let a = row(&[("id", Datum::Null)]);
        let b = row(&[("id", Datum::Null)]);
        assert!(!rule.conflicts(&a, &b));
    }

    #[test]
    fn mixed_operators() {
        // Same room, different booking: conflict only if the other starts earlier.
        let rule = ExclusionRule::new(
            "no_overlap",
            vec![("room", ComparisonOp::Eq), ("slot", ComparisonOp::Lt)],
        );
        let a = row(&[("room", "a".into()), ("slot", 1.into())]);
        let b = row(&[("room", "a".into()), ("slot", 2.into())]);
        assert!(rule.conflicts(&a, &b));
        assert!(!rule.conflicts(&b, &a));
    }

    #[test]
    fn int_and_float_compare() {
        assert_eq!(Datum::Int(2).compare(&Datum::Float(2.0)), Some(Ordering::Equal));
        assert_eq!(Datum::Int(2).compare(&Datum::Text("2".into())), None);
    }

    #[test]
    fn column_type_operator_support() {
        assert!(ColumnType::Date.supports(ComparisonOp::Lt));
        assert!(ColumnType::Boolean.supports(ComparisonOp::Eq));
        assert!(!ColumnType::Boolean.supports(ComparisonOp::Lt));
        assert!(!ColumnType::Jsonb.supports(ComparisonOp::Eq));
    }

    #[test]
    fn placement_keys_sort_by_shard() {
        let a = ShardPlacement::new("events", 2, "w1");
        let b = ShardPlacement::new("events", 10, "w2");
        assert!(a.table_key() < b.table_key());
        assert_eq!(a.relation, "events:2");
        assert!(a.table_key().starts_with(&placement_prefix("events")));
    }

    #[test]
    fn placement_keys_sort_past_five_digits() {
        let a = placement_key("events", 99_999);
        let b = placement_key("events", 100_000);
        let max = placement_key("events", u32::MAX);
        assert!(a < b);
        assert!(b < max);
    }

    #[test]
    fn shard_handle_is_not_an_identifier() {
        let p = ShardPlacement::new("t", 0, "w1");
        assert_eq!(p.relation, "t:0");
        assert!(!p.relation.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn comparison_op_parses_symbols() {
        assert_eq!("=".parse::<ComparisonOp>(), Ok(ComparisonOp::Eq));
        assert_eq!("<>".parse::<ComparisonOp>(), Ok(ComparisonOp::Ne));
        assert!("~~".parse::<ComparisonOp>().is_err());
    }

    #[test]
    fn column_type_parses_sql_names() {
        assert_eq!("BIGINT".parse::<ColumnType>(), Ok(ColumnType::BigInt));
        assert_eq!("int4".parse::<ColumnType>(), Ok(ColumnType::Integer));
        assert!("blob".parse::<ColumnType>().is_err());
    }
}
