//! # Catalog Replication Engine
//!
//! Clones or restores a whole structured catalog (schemas, tables, columns,
//! keys, foreign keys, policy and row data) from a source catalog service
//! into a destination catalog service, resumably.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               CloneEngine                                 │
//! │                                                                           │
//! │  ┌─────────────┐    ┌────────────────┐    ┌───────────────────────────┐   │
//! │  │ ModelDiffer │───►│ SchemaMigrator │───►│ TableCopier /             │   │
//! │  │ (plan)      │    │ (stage 1)      │    │ PipelinedCopier (rows)    │   │
//! │  └─────────────┘    └────────────────┘    └───────────────────────────┘   │
//! │                                                        │                  │
//! │                                                        ▼                  │
//! │  ┌────────────────────┐    ┌────────────────┐    ┌───────────────────┐    │
//! │  │ ConfigSynchronizer │◄───│ SchemaMigrator │◄───│ reconcile         │    │
//! │  │ (annotations/ACLs) │    │ (stage 2, FKs) │    │ (identity tables) │    │
//! │  └────────────────────┘    └────────────────┘    └───────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────────┘
//!            ▲                                               ▲
//!            │              CatalogService (src, dst)        │
//!            └───────────────────────────────────────────────┘
//! ```
//!
//! ## Restart State
//!
//! Nothing is persisted locally. Each destination table carries a progress
//! marker annotation, and the row cursor is the largest `RID` the
//! destination already holds. Rerunning a clone continues where the last
//! one stopped.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use catalog_replication::{CloneConfig, CloneEngine, MemoryCatalog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let src = Arc::new(MemoryCatalog::new("source"));
//!     let dst = Arc::new(MemoryCatalog::new("destination"));
//!
//!     let engine = CloneEngine::new(CloneConfig::default(), src, dst);
//!     match engine.run().await {
//!         Ok(report) => println!("copied {} rows", report.rows_copied),
//!         Err(e) => eprintln!("clone failed: {e}"),
//!     }
//! }
//! ```

pub mod config;
pub mod config_sync;
pub mod coordinator;
pub mod copier;
pub mod cursor;
pub mod diff;
pub mod error;
pub mod marker;
pub mod memory;
pub mod metrics;
pub mod migrator;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod resilience;
pub mod service;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::{CloneConfig, ConfigSyncConfig, CopyConfig, CopyMode};
pub use config_sync::{equivalent, Comparator, ConfigSynchronizer, SyncStats};
pub use coordinator::{CloneEngine, ClonePhase, CloneProgress, CloneReport};
pub use copier::{CopySummary, TableCopier};
pub use diff::{MigrationPlan, ModelDiffer};
pub use error::{CloneError, Result};
pub use marker::{ProgressMarker, CLONE_STATE_TAG};
pub use memory::MemoryCatalog;
pub use model::{CatalogModel, ForeignKeyIdentity, NodePath, Row, RowId, TableName};
pub use pipeline::PipelinedCopier;
pub use service::{CatalogService, InsertOptions, ServiceError};
