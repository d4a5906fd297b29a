use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use shardline_catalog::{CatalogStore, ColumnDef, ComparisonOp, IdentitySpec, PartitionBounds};
use shardline_core::EngineConfig;
use shardline_engine::{AggregateResult, Engine, MemoryBackend};

pub mod metadata;
pub mod table;

pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

pub fn open_engine(catalog_path: &Path, config: EngineConfig) -> anyhow::Result<Engine> {
    let catalog = CatalogStore::open(catalog_path)
        .with_context(|| format!("failed to open catalog {}", catalog_path.display()))?;
    info!(path = ?catalog_path, version = catalog.version()?, "catalog opened");
    Ok(Engine::new(catalog, Arc::new(MemoryBackend::new()), config))
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the aggregate and fail the command when any target did not apply.
pub fn report(result: &AggregateResult) -> anyhow::Result<()> {
    print_json(result)?;
    if !result.is_success() {
        anyhow::bail!(
            "{}: {} failed, {} skipped of {} targets",
            result.operation,
            result.failed().count(),
            result.skipped().count(),
            result.targets.len()
        );
    }
    Ok(())
}

pub fn bounds(from: Option<String>, to: Option<String>) -> Option<PartitionBounds> {
    match (from, to) {
        (Some(from), Some(to)) => Some(PartitionBounds { from, to }),
        _ => None,
    }
}

/// `name:type`
pub fn parse_column(s: &str) -> Result<ColumnDef, String> {
    let (name, data_type) = s
        .split_once(':')
        .ok_or_else(|| format!("expected name:type, got {s:?}"))?;
    Ok(ColumnDef::new(name, data_type.parse()?))
}

/// `column[:start[:increment]]`, start and increment default to 1.
pub fn parse_identity(s: &str) -> Result<IdentitySpec, String> {
    let mut parts = s.split(':');
    let column = parts.next().filter(|c| !c.is_empty()).ok_or("missing column")?;
    let mut number = |what: &str| -> Result<i64, String> {
        match parts.next() {
            Some(v) => v.parse().map_err(|_| format!("invalid {what}: {v:?}")),
            None => Ok(1),
        }
    };
    let start = number("start")?;
    let increment = number("increment")?;
    Ok(IdentitySpec::new(column, start, increment))
}

/// `column:operator`
pub fn parse_element(s: &str) -> Result<(String, ComparisonOp), String> {
    let (column, op) = s
        .split_once(':')
        .ok_or_else(|| format!("expected column:operator, got {s:?}"))?;
    Ok((column.to_string(), op.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_catalog::ColumnType;

    #[test]
    fn column_argument() {
        assert_eq!(
            parse_column("id:bigint").unwrap(),
            ColumnDef::new("id", ColumnType::BigInt)
        );
        assert!(parse_column("id").is_err());
        assert!(parse_column("id:blob").is_err());
    }

    #[test]
    fn identity_argument_defaults() {
        assert_eq!(parse_identity("id").unwrap(), IdentitySpec::new("id", 1, 1));
        assert_eq!(
            parse_identity("id:100:10").unwrap(),
            IdentitySpec::new("id", 100, 10)
        );
        assert!(parse_identity("id:x").is_err());
    }

    #[test]
    fn element_argument() {
        assert_eq!(
            parse_element("date:=").unwrap(),
            ("date".to_string(), ComparisonOp::Eq)
        );
        assert_eq!(
            parse_element("slot:<").unwrap(),
            ("slot".to_string(), ComparisonOp::Lt)
        );
    }

    #[test]
    fn config_defaults_without_file() {
        assert_eq!(load_config(None).unwrap(), EngineConfig::default());
    }

    #[tokio::test]
    async fn engine_on_disk_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.redb");
        let engine = open_engine(&path, EngineConfig::default()).unwrap();

        table::create_root(
            &engine,
            "events".to_string(),
            vec![parse_column("id:bigint").unwrap()],
            None,
            Some(parse_identity("id").unwrap()),
            Vec::new(),
        )
        .await
        .unwrap();
        table::create_partition(&engine, "events", "p1".to_string(), None, None, None)
            .await
            .unwrap();

        assert_eq!(engine.catalog().children_of("events").unwrap().len(), 1);
    }
}
