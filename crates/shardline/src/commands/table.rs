use serde_json::json;

use shardline_catalog::{ColumnDef, IdentitySpec, PartitionBounds};
use shardline_engine::{ChildSource, ChildSpec, Engine, IdentityOverride, RootSpec};

use super::{print_json, report};

pub async fn create_root(
    engine: &Engine,
    id: String,
    columns: Vec<ColumnDef>,
    access_method: Option<String>,
    identity: Option<IdentitySpec>,
    partition_key: Vec<String>,
) -> anyhow::Result<()> {
    let result = engine
        .create_root(RootSpec {
            id,
            columns,
            access_method,
            identity,
            partition_key,
        })
        .await?;
    report(&result)
}

pub async fn create_partition(
    engine: &Engine,
    parent: &str,
    id: String,
    bounds: Option<PartitionBounds>,
    identity_start: Option<i64>,
    identity_increment: Option<i64>,
) -> anyhow::Result<()> {
    let identity = identity_start.map(|start| IdentityOverride {
        start,
        increment: identity_increment.unwrap_or(1),
    });
    let spec = ChildSpec {
        id,
        bounds,
        source: ChildSource::Create { identity },
    };
    let result = engine.create_or_attach_child(parent, spec).await?;
    report(&result)
}

pub async fn attach_partition(
    engine: &Engine,
    parent: &str,
    id: String,
    bounds: Option<PartitionBounds>,
    columns: Vec<ColumnDef>,
    identity: Option<IdentitySpec>,
    convert_identity: bool,
) -> anyhow::Result<()> {
    let spec = ChildSpec {
        id,
        bounds,
        source: ChildSource::Attach {
            columns,
            identity,
            convert_identity,
        },
    };
    let result = engine.create_or_attach_child(parent, spec).await?;
    report(&result)
}

pub async fn detach(engine: &Engine, id: &str) -> anyhow::Result<()> {
    let detached = engine.detach_child(id).await?;
    print_json(&json!({ "detached": detached }))
}

/// Without a root, every node in creation order. With one, its tree and
/// each node's placements.
pub fn show(engine: &Engine, root: Option<&str>) -> anyhow::Result<()> {
    let Some(root) = root else {
        let nodes = engine.catalog().list_nodes()?;
        return print_json(&json!({
            "version": engine.catalog().version()?,
            "nodes": nodes,
        }));
    };

    let tree: Vec<serde_json::Value> = engine
        .resolve(root)?
        .into_iter()
        .map(|member| {
            json!({
                "node": member.node,
                "placements": member.placements,
            })
        })
        .collect();
    print_json(&tree)
}
