//! shardline-engine — metadata propagation for partitioned, distributed tables.
//!
//! Decides which physical objects receive which metadata when a table's
//! shape changes, applies it, and reports every target's outcome.
//!
//! # Architecture
//!
//! ```text
//! Engine (DDL entry points)
//!   ├── resolver     root + descendants in creation order, with placements
//!   ├── inheritance  validation and per-target delta synthesis
//!   │                (access method, identity spec, exclusion rules, attach)
//!   ├── Coordinator  primary node first, then JoinSet fan-out per node
//!   │   ├── NodeLocks      one metadata lock per table node
//!   │   └── ApplyService   opaque physical apply backend
//!   └── CatalogStore records only what was actually applied
//! ```
//!
//! Inheritance is a copy taken at creation/attach time. Changing a parent
//! never rewrites existing children unless `alter_existing_children` is
//! invoked explicitly.
//!
//! Fan-out is best-effort per target: no cross-target transaction, no
//! early cancellation, no automatic retry. A failure on the primary node
//! skips every other target.

pub mod apply;
pub mod coordinator;
pub mod delta;
pub mod engine;
pub mod error;
pub mod inheritance;
pub mod locks;
pub mod memory;
pub mod placement;
pub mod resolver;

pub use apply::{ApplyError, ApplyFuture, ApplyService, PhysicalState};
pub use coordinator::{AggregateResult, Coordinator, SkipReason, TargetOutcome, TargetReport};
pub use delta::{Delta, DeltaSet, MetadataChange, Operation};
pub use engine::{ChildSource, ChildSpec, DistributeRequest, Engine, IdentityOverride, RootSpec};
pub use error::{EngineError, EngineResult, ValidationError};
pub use inheritance::ExclusionScope;
pub use locks::NodeLocks;
pub use memory::MemoryBackend;
pub use resolver::{ResolvedNode, Target, resolve};
