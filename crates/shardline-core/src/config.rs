//! shardline.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine-wide settings shared by the catalog, the propagation engine and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Registered storage access methods. Anything else is rejected.
    pub access_methods: Vec<String>,
    /// Access method given to a root created without an explicit one.
    pub default_access_method: String,
    /// Deadline for a single target's apply call, in milliseconds.
    pub apply_timeout_ms: u64,
    /// Shard count used by `distribute` when none is given.
    pub default_shard_count: u32,
    /// Worker locations used by `distribute` when none are given.
    pub workers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            access_methods: vec!["heap".to_string(), "columnar".to_string()],
            default_access_method: "heap".to_string(),
            apply_timeout_ms: 5_000,
            default_shard_count: 4,
            workers: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.access_methods.is_empty() {
            anyhow::bail!("access_methods must register at least one method");
        }
        if !self.is_registered(&self.default_access_method) {
            anyhow::bail!(
                "default_access_method {:?} is not in access_methods",
                self.default_access_method
            );
        }
        if self.default_shard_count == 0 {
            anyhow::bail!("default_shard_count must be greater than zero");
        }
        if self.apply_timeout_ms == 0 {
            anyhow::bail!("apply_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Whether `method` is in the access method registry.
    pub fn is_registered(&self, method: &str) -> bool {
        self.access_methods.iter().any(|m| m == method)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}
