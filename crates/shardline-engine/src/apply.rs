//! Physical apply service — the seam between the engine and storage.
//!
//! The engine never touches physical storage itself. A backend implements
//! [`ApplyService`] for one physical target at a time and reports typed
//! failures; the coordinator turns those into per-target outcomes.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use shardline_catalog::{AccessMethod, Datum, ExclusionRule, IdentitySpec};

use crate::delta::MetadataChange;
use crate::resolver::Target;

/// Boxed future returned by every apply-service call.
pub type ApplyFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApplyError>> + Send + 'a>>;

/// A failure applying metadata to one target.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyError {
    #[error("exclusion violation on {rule}: conflicting key ({})", display_key(.key))]
    ExclusionViolation {
        rule: String,
        key: Vec<(String, Datum)>,
    },

    #[error("timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("rule name {rule} is already used by a different rule")]
    NameConflict { rule: String },

    #[error("target unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("backend error: {reason}")]
    Backend { reason: String },
}

fn display_key(key: &[(String, Datum)]) -> String {
    key.iter()
        .map(|(column, value)| format!("{column}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Metadata currently present on a physical target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalState {
    pub access_method: Option<AccessMethod>,
    pub identity: Option<IdentitySpec>,
    pub rules: Vec<ExclusionRule>,
}

impl PhysicalState {
    /// Whether `change` is already in effect.
    ///
    /// A rule with the same name but a different definition is a
    /// [`ApplyError::NameConflict`], never an overwrite.
    pub fn already_has(&self, change: &MetadataChange) -> Result<bool, ApplyError> {
        match change {
            MetadataChange::AccessMethod(m) => Ok(self.access_method.as_ref() == Some(m)),
            MetadataChange::IdentitySpec(s) => Ok(self.identity.as_ref() == Some(s)),
            MetadataChange::ExclusionRule(rule) => {
                match self.rules.iter().find(|r| r.name == rule.name) {
                    Some(existing) if existing == rule => Ok(true),
                    Some(_) => Err(ApplyError::NameConflict {
                        rule: rule.name.clone(),
                    }),
                    None => Ok(false),
                }
            }
        }
    }
}

/// Physical apply backend, injected into the engine.
pub trait ApplyService: Send + Sync {
    /// Read the metadata currently present on `target`.
    fn describe<'a>(&'a self, target: &'a Target) -> ApplyFuture<'a, PhysicalState>;

    fn apply_access_method<'a>(
        &'a self,
        target: &'a Target,
        method: &'a AccessMethod,
    ) -> ApplyFuture<'a, ()>;

    fn apply_identity_spec<'a>(
        &'a self,
        target: &'a Target,
        spec: &'a IdentitySpec,
    ) -> ApplyFuture<'a, ()>;

    /// Install `rule`, validating it against the target's existing rows.
    fn apply_exclusion_rule<'a>(
        &'a self,
        target: &'a Target,
        rule: &'a ExclusionRule,
    ) -> ApplyFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_catalog::ComparisonOp;

    #[test]
    fn already_has_detects_equal_values() {
        let rule = ExclusionRule::new("excl", vec![("id", ComparisonOp::Eq)]);
        let state = PhysicalState {
            access_method: Some(AccessMethod::new("columnar")),
            identity: Some(IdentitySpec::new("id", 1, 1)),
            rules: vec![rule.clone()],
        };

        assert_eq!(
            state.already_has(&MetadataChange::AccessMethod(AccessMethod::new("columnar"))),
            Ok(true)
        );
        assert_eq!(
            state.already_has(&MetadataChange::AccessMethod(AccessMethod::new("heap"))),
            Ok(false)
        );
        assert_eq!(
            state.already_has(&MetadataChange::IdentitySpec(IdentitySpec::new("id", 1, 2))),
            Ok(false)
        );
        assert_eq!(state.already_has(&MetadataChange::ExclusionRule(rule)), Ok(true));
    }

    #[test]
    fn same_rule_name_different_definition_conflicts() {
        let state = PhysicalState {
            rules: vec![ExclusionRule::new("excl", vec![("id", ComparisonOp::Eq)])],
            ..PhysicalState::default()
        };
        let other = ExclusionRule::new("excl", vec![("date", ComparisonOp::Eq)]);

        assert_eq!(
            state.already_has(&MetadataChange::ExclusionRule(other)),
            Err(ApplyError::NameConflict {
                rule: "excl".to_string()
            })
        );
    }

    #[test]
    fn violation_message_names_rule_and_key() {
        let err = ApplyError::ExclusionViolation {
            rule: "c1_excl".to_string(),
            key: vec![
                ("date".to_string(), Datum::Text("2024-01-01".to_string())),
                ("id".to_string(), Datum::Int(100)),
            ],
        };
        assert_eq!(
            err.to_string(),
            "exclusion violation on c1_excl: conflicting key (date='2024-01-01', id=100)"
        );
    }
}
