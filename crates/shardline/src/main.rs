//! shardline — operator CLI for the metadata propagation engine.
//!
//! Every command opens the catalog, runs one engine operation and prints
//! its result as JSON on stdout. Physical metadata is applied to the
//! in-process memory backend, so each invocation starts from empty
//! relations and applies everything it propagates.
//!
//! # Usage
//!
//! ```text
//! shardline create-root --id events --column id:bigint --column date:date \
//!     --identity id:1:1 --partition-key date --access-method columnar
//! shardline create-partition --parent events --id events_2024 --from 2024-01-01 --to 2025-01-01
//! shardline add-exclusion --root events --name excl --element date:= --element id:=
//! shardline distribute --root events --column id --shards 4 --worker w1 --worker w2
//! shardline show --root events
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shardline_catalog::{ColumnDef, ComparisonOp, IdentitySpec};

mod commands;

#[derive(Parser)]
#[command(
    name = "shardline",
    about = "Shardline — metadata propagation for partitioned, distributed tables",
    version,
    propagate_version = true
)]
struct Cli {
    /// Catalog database file.
    #[arg(long, global = true, default_value = "shardline.redb")]
    catalog: PathBuf,

    /// Engine configuration file (shardline.toml). Built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a root partitioned table
    CreateRoot {
        #[arg(long)]
        id: String,
        /// Column as name:type, e.g. id:bigint. Repeatable.
        #[arg(long = "column", required = true, value_parser = commands::parse_column)]
        columns: Vec<ColumnDef>,
        /// Registered access method (default from config).
        #[arg(long)]
        access_method: Option<String>,
        /// Identity column as column[:start[:increment]].
        #[arg(long, value_parser = commands::parse_identity)]
        identity: Option<IdentitySpec>,
        /// Partition key column. Repeatable.
        #[arg(long = "partition-key")]
        partition_key: Vec<String>,
    },
    /// Create a new partition under a parent
    CreatePartition {
        #[arg(long)]
        parent: String,
        #[arg(long)]
        id: String,
        /// Inclusive lower bound.
        #[arg(long, requires = "to")]
        from: Option<String>,
        /// Exclusive upper bound.
        #[arg(long, requires = "from")]
        to: Option<String>,
        /// Own identity start value (keeps the parent's column).
        #[arg(long)]
        identity_start: Option<i64>,
        /// Own identity increment (requires --identity-start).
        #[arg(long, requires = "identity_start")]
        identity_increment: Option<i64>,
    },
    /// Attach an existing table as a partition
    AttachPartition {
        #[arg(long)]
        parent: String,
        #[arg(long)]
        id: String,
        /// Column of the attached table as name:type. Repeatable.
        #[arg(long = "column", required = true, value_parser = commands::parse_column)]
        columns: Vec<ColumnDef>,
        /// The table's own identity column as column[:start[:increment]].
        #[arg(long, value_parser = commands::parse_identity)]
        identity: Option<IdentitySpec>,
        /// Convert a plain column into the parent's identity column.
        #[arg(long)]
        convert_identity: bool,
        #[arg(long, requires = "to")]
        from: Option<String>,
        #[arg(long, requires = "from")]
        to: Option<String>,
    },
    /// Change a table's access method (existing children keep theirs)
    SetAccessMethod {
        #[arg(long)]
        root: String,
        #[arg(long)]
        method: String,
    },
    /// Push a table's current access method to all existing children
    AlterChildren {
        #[arg(long)]
        root: String,
    },
    /// Add an exclusion rule and mirror it onto every partition
    AddExclusion {
        #[arg(long)]
        root: String,
        /// Rule base name.
        #[arg(long)]
        name: String,
        /// Element as column:operator, e.g. date:=. Repeatable.
        #[arg(long = "element", required = true, value_parser = commands::parse_element)]
        elements: Vec<(String, ComparisonOp)>,
    },
    /// Split a root and its partitions into shard placements
    Distribute {
        #[arg(long)]
        root: String,
        /// Distribution column.
        #[arg(long)]
        column: String,
        /// Shard count (default from config).
        #[arg(long)]
        shards: Option<u32>,
        /// Worker location. Repeatable; defaults from config.
        #[arg(long = "worker")]
        workers: Vec<String>,
    },
    /// Detach a partition and its descendants from the catalog
    Detach {
        #[arg(long)]
        id: String,
    },
    /// Report whether an exclusion rule holds globally or per partition
    Scope {
        #[arg(long)]
        node: String,
        #[arg(long)]
        rule: String,
    },
    /// Show the catalog, or one table tree with its placements
    Show {
        #[arg(long)]
        root: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,shardline=debug"))?,
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }
    let engine = commands::open_engine(&cli.catalog, config)?;

    match cli.command {
        Commands::CreateRoot {
            id,
            columns,
            access_method,
            identity,
            partition_key,
        } => {
            commands::table::create_root(&engine, id, columns, access_method, identity, partition_key)
                .await
        }
        Commands::CreatePartition {
            parent,
            id,
            from,
            to,
            identity_start,
            identity_increment,
        } => {
            commands::table::create_partition(
                &engine,
                &parent,
                id,
                commands::bounds(from, to),
                identity_start,
                identity_increment,
            )
            .await
        }
        Commands::AttachPartition {
            parent,
            id,
            columns,
            identity,
            convert_identity,
            from,
            to,
        } => {
            commands::table::attach_partition(
                &engine,
                &parent,
                id,
                commands::bounds(from, to),
                columns,
                identity,
                convert_identity,
            )
            .await
        }
        Commands::SetAccessMethod { root, method } => {
            commands::metadata::set_access_method(&engine, &root, &method).await
        }
        Commands::AlterChildren { root } => commands::metadata::alter_children(&engine, &root).await,
        Commands::AddExclusion {
            root,
            name,
            elements,
        } => commands::metadata::add_exclusion(&engine, &root, &name, elements).await,
        Commands::Distribute {
            root,
            column,
            shards,
            workers,
        } => commands::metadata::distribute(&engine, &root, column, shards, workers).await,
        Commands::Detach { id } => commands::table::detach(&engine, &id).await,
        Commands::Scope { node, rule } => commands::metadata::scope(&engine, &node, &rule),
        Commands::Show { root } => commands::table::show(&engine, root.as_deref()),
        Commands::Config => Ok(()),
    }
}
