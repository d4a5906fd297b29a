//! Inheritance engine — validation and per-target delta synthesis.
//!
//! Everything here is pure: functions take catalog snapshots and return
//! either a validation error or the node/deltas to write and apply. The
//! [`Engine`](crate::Engine) does the I/O around them.
//!
//! A child's metadata is a copy of its parent's taken when the child is
//! created or attached:
//!
//! | Metadata       | Create                          | Attach                                  |
//! |----------------|---------------------------------|-----------------------------------------|
//! | access method  | parent's current value          | parent's current value                  |
//! | identity spec  | parent's, or an explicit override | must match the parent's column, or be converted explicitly |
//! | exclusion rules| parent's rules, mirrored        | parent's rules, mirrored                |

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use shardline_catalog::{
    AccessMethod, ColumnDef, ExclusionRule, IdentitySpec, TableNode,
};
use shardline_core::{EngineConfig, validate_identifier};

use crate::delta::{DeltaSet, MetadataChange};
use crate::engine::{ChildSource, ChildSpec, IdentityOverride, RootSpec};
use crate::error::ValidationError;
use crate::resolver::{ResolvedNode, Target};

/// Where an exclusion rule's guarantee holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionScope {
    /// Partition key and distribution column are compared with `=`, so
    /// conflicting rows always land in the same partition and shard.
    Global,
    /// Only rows within one partition (and one shard) are checked.
    PerPartition,
}

impl fmt::Display for ExclusionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionScope::Global => f.write_str("global"),
            ExclusionScope::PerPartition => f.write_str("per_partition"),
        }
    }
}

/// Check `method` against the registry.
pub fn validate_access_method(
    config: &EngineConfig,
    method: &str,
) -> Result<AccessMethod, ValidationError> {
    if config.is_registered(method) {
        Ok(AccessMethod::new(method))
    } else {
        Err(ValidationError::InvalidAccessMethod {
            method: method.to_string(),
        })
    }
}

fn validate_columns(node_id: &str, columns: &[ColumnDef]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for column in columns {
        validate_identifier(&column.name)?;
        if !seen.insert(column.name.as_str()) {
            return Err(ValidationError::SchemaMismatch {
                node: node_id.to_string(),
                reason: format!("column {} is defined twice", column.name),
            });
        }
    }
    Ok(())
}

/// An identity spec must name an existing integer column and step by a
/// non-zero increment.
fn validate_identity(columns: &[ColumnDef], spec: &IdentitySpec) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidIdentity {
        column: spec.column.clone(),
        reason: reason.to_string(),
    };
    let column = columns
        .iter()
        .find(|c| c.name == spec.column)
        .ok_or_else(|| invalid("column does not exist"))?;
    if !column.data_type.is_integer() {
        return Err(invalid("identity columns must have an integer type"));
    }
    if spec.increment == 0 {
        return Err(invalid("increment must not be zero"));
    }
    Ok(())
}

/// Build a new root node from `spec`.
pub fn root_node(config: &EngineConfig, spec: &RootSpec) -> Result<TableNode, ValidationError> {
    validate_identifier(&spec.id)?;
    validate_columns(&spec.id, &spec.columns)?;

    let method = spec
        .access_method
        .as_deref()
        .unwrap_or(&config.default_access_method);
    let access_method = validate_access_method(config, method)?;

    if let Some(identity) = &spec.identity {
        validate_identity(&spec.columns, identity)?;
    }
    for key in &spec.partition_key {
        if !spec.columns.iter().any(|c| &c.name == key) {
            return Err(ValidationError::SchemaMismatch {
                node: spec.id.clone(),
                reason: format!("partition key column {key} does not exist"),
            });
        }
    }

    Ok(TableNode {
        id: spec.id.clone(),
        parent: None,
        bounds: None,
        created_at: 0,
        seq: 0,
        version: 0,
        columns: spec.columns.clone(),
        access_method,
        identity: spec.identity.clone(),
        rules: Vec::new(),
        partition_key: spec.partition_key.clone(),
        distribution: None,
    })
}

/// Snapshot `parent` into a new child described by `spec`.
///
/// The child copies the parent's current access method, distribution and
/// rules (mirrored under the child's name). Columns and identity depend
/// on whether the child is created or attached.
pub fn inherit_child(parent: &TableNode, spec: &ChildSpec) -> Result<TableNode, ValidationError> {
    validate_identifier(&spec.id)?;

    let columns = match &spec.source {
        ChildSource::Create { .. } => parent.columns.clone(),
        ChildSource::Attach { columns, .. } => {
            validate_columns(&spec.id, columns)?;
            check_attach_schema(parent, &spec.id, columns)?;
            columns.clone()
        }
    };
    let identity = inherit_identity(parent, &spec.id, &columns, &spec.source)?;

    Ok(TableNode {
        id: spec.id.clone(),
        parent: Some(parent.id.clone()),
        bounds: spec.bounds.clone(),
        created_at: 0,
        seq: 0,
        version: 0,
        columns,
        access_method: parent.access_method.clone(),
        identity,
        rules: rules_for_child(parent, &spec.id)?,
        partition_key: Vec::new(),
        distribution: parent.distribution.clone(),
    })
}

/// An attached table must carry exactly the parent's columns and types.
fn check_attach_schema(
    parent: &TableNode,
    child_id: &str,
    columns: &[ColumnDef],
) -> Result<(), ValidationError> {
    let mismatch = |reason: String| ValidationError::SchemaMismatch {
        node: child_id.to_string(),
        reason,
    };
    for wanted in &parent.columns {
        match columns.iter().find(|c| c.name == wanted.name) {
            None => return Err(mismatch(format!("missing column {}", wanted.name))),
            Some(c) if c.data_type != wanted.data_type => {
                return Err(mismatch(format!(
                    "column {} is {:?}, parent {} has {:?}",
                    c.name, c.data_type, parent.id, wanted.data_type
                )));
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = columns.iter().find(|c| parent.column(&c.name).is_none()) {
        return Err(mismatch(format!(
            "column {} does not exist on parent {}",
            extra.name, parent.id
        )));
    }
    Ok(())
}

/// Identity spec of a new child.
///
/// Attaching never converts a plain column implicitly: without an
/// identity of its own the table is accepted only when
/// `convert_identity` is set.
pub fn inherit_identity(
    parent: &TableNode,
    child_id: &str,
    columns: &[ColumnDef],
    source: &ChildSource,
) -> Result<Option<IdentitySpec>, ValidationError> {
    let mismatch = |column: &str, reason: String| ValidationError::IdentityColumnMismatch {
        node: child_id.to_string(),
        column: column.to_string(),
        reason,
    };

    let Some(inherited) = &parent.identity else {
        return match source {
            ChildSource::Create { identity: None } => Ok(None),
            ChildSource::Create { identity: Some(_) } => Err(mismatch(
                "",
                format!("parent {} has no identity column to override", parent.id),
            )),
            ChildSource::Attach { identity, .. } => {
                if let Some(own) = identity {
                    validate_identity(columns, own)?;
                }
                Ok(identity.clone())
            }
        };
    };

    match source {
        ChildSource::Create { identity: None } => Ok(Some(inherited.clone())),
        ChildSource::Create {
            identity: Some(IdentityOverride { start, increment }),
        } => {
            let spec = IdentitySpec::new(&inherited.column, *start, *increment);
            validate_identity(columns, &spec)?;
            Ok(Some(spec))
        }
        ChildSource::Attach {
            identity: Some(own),
            ..
        } => {
            if own.column != inherited.column {
                return Err(mismatch(
                    &own.column,
                    format!(
                        "parent {} generates {}, not {}",
                        parent.id, inherited.column, own.column
                    ),
                ));
            }
            Ok(Some(inherited.clone()))
        }
        ChildSource::Attach {
            identity: None,
            convert_identity,
            ..
        } => {
            let column = &inherited.column;
            if !convert_identity {
                return Err(mismatch(
                    column,
                    "column is not a generated identity column and conversion was not requested"
                        .to_string(),
                ));
            }
            let compatible = match (columns.iter().find(|c| &c.name == column), parent.column(column)) {
                (Some(own), Some(theirs)) => own.data_type == theirs.data_type && own.data_type.is_integer(),
                _ => false,
            };
            if !compatible {
                return Err(mismatch(
                    column,
                    "no column with the same name and integer type to convert".to_string(),
                ));
            }
            Ok(Some(inherited.clone()))
        }
    }
}

/// The parent's installed rules, mirrored for `child_id`. Every mirrored
/// name must itself be a valid identifier.
pub fn rules_for_child(
    parent: &TableNode,
    child_id: &str,
) -> Result<Vec<ExclusionRule>, ValidationError> {
    parent
        .rules
        .iter()
        .map(|rule| {
            let mirrored = rule.mirrored_for(child_id);
            validate_identifier(&mirrored.name)?;
            Ok(mirrored)
        })
        .collect()
}

/// Check that `rule`'s mirrored name is a valid identifier on every
/// descendant in `resolved` (the first member is the rule's own node).
pub fn validate_mirrors(resolved: &[ResolvedNode], rule: &ExclusionRule) -> Result<(), ValidationError> {
    for member in resolved.iter().skip(1) {
        validate_identifier(&rule.mirrored_for(&member.node.id).name)?;
    }
    Ok(())
}

/// Validate a new rule against `node` and normalize it to a root-level
/// rule (`name == base_name`).
pub fn validate_rule(node: &TableNode, rule: &ExclusionRule) -> Result<ExclusionRule, ValidationError> {
    validate_identifier(&rule.base_name)?;
    let invalid = |reason: String| ValidationError::InvalidConstraintColumns {
        rule: rule.base_name.clone(),
        reason,
    };

    if rule.elements.is_empty() {
        return Err(invalid("rule compares no columns".to_string()));
    }
    for element in &rule.elements {
        let column = node
            .column(&element.column)
            .ok_or_else(|| invalid(format!("column {} does not exist on {}", element.column, node.id)))?;
        if !column.data_type.supports(element.op) {
            return Err(invalid(format!(
                "operator {} is not supported for column {} of type {:?}",
                element.op.symbol(),
                column.name,
                column.data_type
            )));
        }
    }
    if node.rule(&rule.base_name).is_some() {
        return Err(ValidationError::DuplicateRuleName {
            node: node.id.clone(),
            rule: rule.base_name.clone(),
        });
    }

    Ok(ExclusionRule {
        name: rule.base_name.clone(),
        base_name: rule.base_name.clone(),
        elements: rule.elements.clone(),
    })
}

/// Everything a fresh target of `node` must receive: access method,
/// identity spec, then every installed rule.
pub fn node_deltas(set: &mut DeltaSet, node: &TableNode, targets: &[Target]) {
    for target in targets {
        set.push(
            target.clone(),
            MetadataChange::AccessMethod(node.access_method.clone()),
        );
        if let Some(identity) = &node.identity {
            set.push(target.clone(), MetadataChange::IdentitySpec(identity.clone()));
        }
        for rule in &node.rules {
            set.push(target.clone(), MetadataChange::ExclusionRule(rule.clone()));
        }
    }
}

/// Install `rule` on the first resolved node and its mirror on every
/// descendant.
pub fn rule_deltas(set: &mut DeltaSet, resolved: &[ResolvedNode], rule: &ExclusionRule) {
    for (i, member) in resolved.iter().enumerate() {
        let instance = if i == 0 {
            rule.clone()
        } else {
            rule.mirrored_for(&member.node.id)
        };
        for target in member.targets() {
            set.push(target, MetadataChange::ExclusionRule(instance.clone()));
        }
    }
}

/// Push `method` to every descendant target (not the first node itself).
pub fn descendant_method_deltas(set: &mut DeltaSet, resolved: &[ResolvedNode], method: &AccessMethod) {
    for member in resolved.iter().skip(1) {
        for target in member.targets() {
            set.push(target, MetadataChange::AccessMethod(method.clone()));
        }
    }
}

/// Where `rule` is enforced, given `root`'s partition key and distribution.
pub fn exclusion_scope(root: &TableNode, rule: &ExclusionRule) -> ExclusionScope {
    let equal: HashSet<&str> = rule.equality_columns().collect();
    let key_covered = !root.partition_key.is_empty()
        && root.partition_key.iter().all(|c| equal.contains(c.as_str()));
    let distribution_covered = root
        .distribution
        .as_ref()
        .is_none_or(|d| equal.contains(d.column.as_str()));

    if key_covered && distribution_covered {
        ExclusionScope::Global
    } else {
        ExclusionScope::PerPartition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_catalog::{ColumnType, ComparisonOp, Distribution, ShardPlacement};
    use shardline_core::IdentError;

    fn root() -> TableNode {
        let config = EngineConfig::default();
        root_node(
            &config,
            &RootSpec {
                id: "events".to_string(),
                columns: vec![
                    ColumnDef::new("id", ColumnType::BigInt),
                    ColumnDef::new("date", ColumnType::Date),
                    ColumnDef::new("payload", ColumnType::Jsonb),
                ],
                access_method: Some("columnar".to_string()),
                identity: Some(IdentitySpec::new("id", 1, 1)),
                partition_key: vec!["date".to_string()],
            },
        )
        .unwrap()
    }

    fn excl() -> ExclusionRule {
        ExclusionRule::new(
            "excl",
            vec![("date", ComparisonOp::Eq), ("id", ComparisonOp::Eq)],
        )
    }

    fn create(id: &str) -> ChildSpec {
        ChildSpec {
            id: id.to_string(),
            bounds: None,
            source: ChildSource::Create { identity: None },
        }
    }

    fn attach(id: &str, identity: Option<IdentitySpec>, convert_identity: bool) -> ChildSpec {
        ChildSpec {
            id: id.to_string(),
            bounds: None,
            source: ChildSource::Attach {
                columns: root().columns,
                identity,
                convert_identity,
            },
        }
    }

    #[test]
    fn root_rejects_unregistered_method() {
        let mut spec = RootSpec {
            id: "events".to_string(),
            columns: vec![ColumnDef::new("id", ColumnType::BigInt)],
            access_method: Some("lsm".to_string()),
            identity: None,
            partition_key: Vec::new(),
        };
        let err = root_node(&EngineConfig::default(), &spec).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidAccessMethod {
                method: "lsm".to_string()
            }
        );

        spec.access_method = None;
        let node = root_node(&EngineConfig::default(), &spec).unwrap();
        assert_eq!(node.access_method.as_str(), "heap");
    }

    #[test]
    fn root_identity_must_be_an_integer_column() {
        let spec = RootSpec {
            id: "events".to_string(),
            columns: vec![ColumnDef::new("code", ColumnType::Text)],
            access_method: None,
            identity: Some(IdentitySpec::new("code", 1, 1)),
            partition_key: Vec::new(),
        };
        assert!(matches!(
            root_node(&EngineConfig::default(), &spec),
            Err(ValidationError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn created_child_snapshots_parent() {
        let mut parent = root();
        parent.rules.push(excl());
        let child = inherit_child(&parent, &create("c1")).unwrap();

        assert_eq!(child.parent.as_deref(), Some("events"));
        assert_eq!(child.access_method, parent.access_method);
        assert_eq!(child.identity, parent.identity);
        assert_eq!(child.columns, parent.columns);
        assert_eq!(child.rules.len(), 1);
        assert_eq!(child.rules[0].name, "c1_excl");
        assert!(child.partition_key.is_empty());
    }

    #[test]
    fn identity_override_keeps_column() {
        let spec = ChildSpec {
            source: ChildSource::Create {
                identity: Some(IdentityOverride {
                    start: 1_000_000,
                    increment: 1,
                }),
            },
            ..create("c2")
        };
        let child = inherit_child(&root(), &spec).unwrap();
        assert_eq!(child.identity, Some(IdentitySpec::new("id", 1_000_000, 1)));
    }

    #[test]
    fn attach_without_identity_requires_conversion() {
        let err = inherit_child(&root(), &attach("legacy", None, false)).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::IdentityColumnMismatch { ref node, ref column, .. }
                if node == "legacy" && column == "id"
        ));

        let child = inherit_child(&root(), &attach("legacy", None, true)).unwrap();
        assert_eq!(child.identity, Some(IdentitySpec::new("id", 1, 1)));
    }

    #[test]
    fn attach_with_other_identity_column_fails() {
        let mut spec = attach("legacy", Some(IdentitySpec::new("other_id", 1, 1)), true);
        if let ChildSource::Attach { columns, .. } = &mut spec.source {
            columns.push(ColumnDef::new("other_id", ColumnType::BigInt));
        }
        // The extra column is already a schema mismatch.
        assert!(matches!(
            inherit_child(&root(), &spec),
            Err(ValidationError::SchemaMismatch { .. })
        ));

        let mut parent = root();
        parent.columns.push(ColumnDef::new("other_id", ColumnType::BigInt));
        assert!(matches!(
            inherit_child(&parent, &spec),
            Err(ValidationError::IdentityColumnMismatch { .. })
        ));
    }

    #[test]
    fn attach_with_matching_identity_adopts_parent_parameters() {
        let child =
            inherit_child(&root(), &attach("legacy", Some(IdentitySpec::new("id", 500, 10)), false))
                .unwrap();
        assert_eq!(child.identity, Some(IdentitySpec::new("id", 1, 1)));
    }

    #[test]
    fn attach_with_wrong_type_is_a_schema_mismatch() {
        let mut spec = attach("legacy", None, true);
        if let ChildSource::Attach { columns, .. } = &mut spec.source {
            columns[0] = ColumnDef::new("id", ColumnType::Text);
        }
        assert!(matches!(
            inherit_child(&root(), &spec),
            Err(ValidationError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn rule_validation() {
        let node = root();
        assert!(validate_rule(&node, &excl()).is_ok());

        let missing = ExclusionRule::new("bad", vec![("nope", ComparisonOp::Eq)]);
        assert!(matches!(
            validate_rule(&node, &missing),
            Err(ValidationError::InvalidConstraintColumns { .. })
        ));

        let jsonb = ExclusionRule::new("bad", vec![("payload", ComparisonOp::Eq)]);
        assert!(matches!(
            validate_rule(&node, &jsonb),
            Err(ValidationError::InvalidConstraintColumns { .. })
        ));

        let empty = ExclusionRule::new("bad", Vec::new());
        assert!(validate_rule(&node, &empty).is_err());
    }

    #[test]
    fn duplicate_rule_name_is_rejected() {
        let mut node = root();
        node.rules.push(excl());
        let other = ExclusionRule::new("excl", vec![("id", ComparisonOp::Eq)]);
        assert_eq!(
            validate_rule(&node, &other).unwrap_err(),
            ValidationError::DuplicateRuleName {
                node: "events".to_string(),
                rule: "excl".to_string()
            }
        );
    }

    #[test]
    fn mirrored_name_must_fit_identifier_length() {
        let long_child = "c".repeat(60);
        let mut parent = root();
        parent.rules.push(excl());
        assert!(matches!(
            inherit_child(&parent, &create(&long_child)),
            Err(ValidationError::InvalidIdentifier(IdentError::TooLong(name)))
                if name == format!("{long_child}_excl")
        ));

        let resolved = vec![
            ResolvedNode {
                node: root(),
                placements: Vec::new(),
            },
            ResolvedNode {
                node: inherit_child(&root(), &create(&long_child)).unwrap(),
                placements: Vec::new(),
            },
        ];
        assert!(validate_mirrors(&resolved[..1], &excl()).is_ok());
        assert!(matches!(
            validate_mirrors(&resolved, &excl()),
            Err(ValidationError::InvalidIdentifier(IdentError::TooLong(_)))
        ));
    }

    #[test]
    fn rule_deltas_mirror_per_descendant() {
        let parent = root();
        let child = inherit_child(&parent, &create("c1")).unwrap();
        let resolved = vec![
            ResolvedNode {
                node: parent,
                placements: Vec::new(),
            },
            ResolvedNode {
                node: child,
                placements: vec![
                    ShardPlacement::new("c1", 0, "w1"),
                    ShardPlacement::new("c1", 1, "w2"),
                ],
            },
        ];

        let mut set = DeltaSet::new(crate::delta::Operation::AddExclusionRule, "events");
        rule_deltas(&mut set, &resolved, &excl());

        let names: Vec<(String, String)> = set
            .deltas
            .iter()
            .map(|d| match &d.change {
                MetadataChange::ExclusionRule(r) => (d.target.relation().to_string(), r.name.clone()),
                other => panic!("unexpected change {other}"),
            })
            .collect();
        assert_eq!(
            names,
            vec![
                ("events".to_string(), "excl".to_string()),
                ("c1:0".to_string(), "c1_excl".to_string()),
                ("c1:1".to_string(), "c1_excl".to_string()),
            ]
        );
    }

    #[test]
    fn node_deltas_carry_full_metadata() {
        let mut node = root();
        node.rules.push(excl());
        let mut set = DeltaSet::new(crate::delta::Operation::CreateChild, "events");
        node_deltas(&mut set, &node, &[Target::local("events")]);

        let kinds: Vec<String> = set.deltas.iter().map(|d| d.change.to_string()).collect();
        assert_eq!(
            kinds,
            vec![
                "access method columnar",
                "identity id (start 1, increment 1)",
                "exclusion rule excl",
            ]
        );
    }

    #[test]
    fn scope_depends_on_key_alignment() {
        let mut node = root();
        assert_eq!(exclusion_scope(&node, &excl()), ExclusionScope::Global);

        let by_id = ExclusionRule::new("by_id", vec![("id", ComparisonOp::Eq)]);
        assert_eq!(exclusion_scope(&node, &by_id), ExclusionScope::PerPartition);

        node.distribution = Some(Distribution {
            column: "payload".to_string(),
            shard_count: 4,
        });
        assert_eq!(exclusion_scope(&node, &excl()), ExclusionScope::PerPartition);

        node.distribution = Some(Distribution {
            column: "id".to_string(),
            shard_count: 4,
        });
        assert_eq!(exclusion_scope(&node, &excl()), ExclusionScope::Global);

        node.partition_key.clear();
        assert_eq!(exclusion_scope(&node, &excl()), ExclusionScope::PerPartition);
    }
}
