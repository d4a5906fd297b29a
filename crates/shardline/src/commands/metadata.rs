use serde_json::json;

use shardline_catalog::{ComparisonOp, ExclusionRule};
use shardline_engine::{DistributeRequest, Engine};

use super::{print_json, report};

pub async fn set_access_method(engine: &Engine, root: &str, method: &str) -> anyhow::Result<()> {
    let result = engine.set_access_method(root, method).await?;
    report(&result)
}

pub async fn alter_children(engine: &Engine, root: &str) -> anyhow::Result<()> {
    let result = engine.alter_existing_children(root).await?;
    report(&result)
}

pub async fn add_exclusion(
    engine: &Engine,
    root: &str,
    name: &str,
    elements: Vec<(String, ComparisonOp)>,
) -> anyhow::Result<()> {
    let rule = ExclusionRule::new(
        name,
        elements.iter().map(|(c, op)| (c.as_str(), *op)).collect(),
    );
    let result = engine.add_exclusion_rule(root, rule).await?;
    report(&result)
}

pub async fn distribute(
    engine: &Engine,
    root: &str,
    column: String,
    shard_count: Option<u32>,
    workers: Vec<String>,
) -> anyhow::Result<()> {
    let request = DistributeRequest {
        column,
        shard_count,
        workers,
    };
    let result = engine.distribute(root, request).await?;
    report(&result)
}

pub fn scope(engine: &Engine, node: &str, rule: &str) -> anyhow::Result<()> {
    let scope = engine.exclusion_scope(node, rule)?;
    print_json(&json!({
        "node": node,
        "rule": rule,
        "scope": scope,
    }))
}
