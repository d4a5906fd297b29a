//! Delta sets — the per-target metadata changes an operation produces.

use std::fmt;

use serde::{Deserialize, Serialize};

use shardline_catalog::{AccessMethod, ExclusionRule, IdentitySpec, NodeId};

use crate::resolver::Target;

/// DDL operation a delta set was synthesized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateRoot,
    SetAccessMethod,
    CreateChild,
    AttachChild,
    AddExclusionRule,
    Distribute,
    AlterExistingChildren,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CreateRoot => "create_root",
            Operation::SetAccessMethod => "set_access_method",
            Operation::CreateChild => "create_child",
            Operation::AttachChild => "attach_child",
            Operation::AddExclusionRule => "add_exclusion_rule",
            Operation::Distribute => "distribute",
            Operation::AlterExistingChildren => "alter_existing_children",
        };
        f.write_str(name)
    }
}

/// One kind of metadata a target can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataChange {
    AccessMethod(AccessMethod),
    IdentitySpec(IdentitySpec),
    ExclusionRule(ExclusionRule),
}

impl fmt::Display for MetadataChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataChange::AccessMethod(m) => write!(f, "access method {m}"),
            MetadataChange::IdentitySpec(s) => write!(
                f,
                "identity {} (start {}, increment {})",
                s.column, s.start, s.increment
            ),
            MetadataChange::ExclusionRule(r) => write!(f, "exclusion rule {}", r.name),
        }
    }
}

/// A single change destined for a single target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub target: Target,
    pub change: MetadataChange,
}

impl Delta {
    pub fn new(target: Target, change: MetadataChange) -> Self {
        Self { target, change }
    }
}

/// Ordered deltas of one logical operation.
///
/// Deltas on the `primary` node run first; if any of them fails the rest
/// are skipped. The remaining deltas keep resolver order (parents before
/// children, siblings in creation order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSet {
    pub operation: Operation,
    pub primary: NodeId,
    pub deltas: Vec<Delta>,
}

impl DeltaSet {
    pub fn new(operation: Operation, primary: &str) -> Self {
        Self {
            operation,
            primary: primary.to_string(),
            deltas: Vec::new(),
        }
    }

    pub fn push(&mut self, target: Target, change: MetadataChange) {
        self.deltas.push(Delta::new(target, change));
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }
}
