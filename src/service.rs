// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Catalog service integration trait.
//!
//! Defines what the engine needs from a catalog service: schema mutation,
//! paged row access, table annotations, per-node configuration replacement
//! and history truncation. The transport binding (HTTP verbs, retries,
//! credentials) lives behind this trait and is not the engine's concern.
//!
//! # Example
//!
//! ```rust,no_run
//! use catalog_replication::service::{BoxFuture, CatalogService, InsertOptions};
//! use catalog_replication::model::{
//!     CatalogModel, Column, ConfigField, ForeignKey, Key, NodePath, Row, RowId, SchemaObject, TableName,
//! };
//! use serde_json::Value;
//!
//! struct ReadOnly;
//!
//! impl CatalogService for ReadOnly {
//!     fn name(&self) -> &str { "read-only" }
//!     fn get_model(&self) -> BoxFuture<'_, CatalogModel> { Box::pin(async { Ok(CatalogModel::default()) }) }
//!     fn post_schema_objects(&self, _: Vec<SchemaObject>) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//!     fn post_column(&self, _: TableName, _: Column) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//!     fn post_key(&self, _: TableName, _: Key) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//!     fn post_foreign_keys(&self, _: Vec<(TableName, ForeignKey)>) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//!     fn max_row_id(&self, _: TableName) -> BoxFuture<'_, Option<RowId>> { Box::pin(async { Ok(None) }) }
//!     fn fetch_page(&self, _: TableName, _: Option<RowId>, _: usize) -> BoxFuture<'_, Vec<Row>> { Box::pin(async { Ok(vec![]) }) }
//!     fn fetch_all(&self, _: TableName) -> BoxFuture<'_, Vec<Row>> { Box::pin(async { Ok(vec![]) }) }
//!     fn insert_rows(&self, _: TableName, rows: Vec<Row>, _: InsertOptions) -> BoxFuture<'_, usize> { Box::pin(async move { Ok(rows.len()) }) }
//!     fn update_rows(&self, _: TableName, _: Vec<String>, _: Vec<String>, rows: Vec<Row>) -> BoxFuture<'_, usize> { Box::pin(async move { Ok(rows.len()) }) }
//!     fn get_table_annotation(&self, _: TableName, _: String) -> BoxFuture<'_, Option<Value>> { Box::pin(async { Ok(None) }) }
//!     fn put_table_annotation(&self, _: TableName, _: String, _: Value) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//!     fn put_config(&self, _: NodePath, _: ConfigField, _: Value) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//!     fn latest_snapshot(&self) -> BoxFuture<'_, String> { Box::pin(async { Ok("2T".to_string()) }) }
//!     fn truncate_history(&self, _: String) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//! }
//! ```

use crate::model::{CatalogModel, Column, ConfigField, ForeignKey, Key, NodePath, Row, RowId, TableName};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

pub use crate::model::SchemaObject;

/// Result type for catalog service operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ServiceResult<T>> + Send + 'a>>;

/// Failure reported by a catalog service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Caller lacks rights for the call.
    Forbidden(String),
    /// The resource changed since it was read.
    PreconditionFailed(String),
    /// Addressed resource does not exist.
    NotFound(String),
    /// Request conflicts with current state (duplicate RID, missing key, ...).
    Conflict(String),
    /// Transport-level failure.
    Transport(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Forbidden(m) => write!(f, "forbidden: {m}"),
            ServiceError::PreconditionFailed(m) => write!(f, "precondition failed: {m}"),
            ServiceError::NotFound(m) => write!(f, "not found: {m}"),
            ServiceError::Conflict(m) => write!(f, "conflict: {m}"),
            ServiceError::Transport(m) => write!(f, "transport: {m}"),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Options for [`CatalogService::insert_rows`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOptions {
    /// Columns whose server-assigned defaults are suppressed, so supplied
    /// values (identifiers, creation timestamps) are kept.
    pub nondefaults: Vec<String>,
    /// Silently skip rows that conflict with existing keys.
    pub on_conflict_skip: bool,
}

impl InsertOptions {
    pub fn preserving(columns: &[&str]) -> Self {
        Self {
            nondefaults: columns.iter().map(|c| c.to_string()).collect(),
            on_conflict_skip: false,
        }
    }

    pub fn skip_conflicts(mut self) -> Self {
        self.on_conflict_skip = true;
        self
    }
}

/// Trait defining what we need from a catalog service.
///
/// Both sides of a clone are `CatalogService`s: the source is only read,
/// the destination is read and mutated. Implementations must be cheap to
/// share behind an `Arc`.
pub trait CatalogService: Send + Sync + 'static {
    /// Human-readable handle for logs (host/catalog id).
    fn name(&self) -> &str;

    /// Fetch the full model document.
    fn get_model(&self) -> BoxFuture<'_, CatalogModel>;

    /// Bulk-create schemas and tables (tables carry no foreign keys).
    fn post_schema_objects(&self, objects: Vec<SchemaObject>) -> BoxFuture<'_, ()>;

    /// Add one column to an existing table.
    fn post_column(&self, table: TableName, column: Column) -> BoxFuture<'_, ()>;

    /// Add one key to an existing table.
    fn post_key(&self, table: TableName, key: Key) -> BoxFuture<'_, ()>;

    /// Bulk-create foreign keys, each attached to its referring table.
    fn post_foreign_keys(&self, fkeys: Vec<(TableName, ForeignKey)>) -> BoxFuture<'_, ()>;

    /// Largest `RID` present in a table, or `None` when empty.
    fn max_row_id(&self, table: TableName) -> BoxFuture<'_, Option<RowId>>;

    /// Up to `limit` rows sorted by `RID`, strictly after `after` when given.
    fn fetch_page(&self, table: TableName, after: Option<RowId>, limit: usize) -> BoxFuture<'_, Vec<Row>>;

    /// Every row of a table (only used for small system tables).
    fn fetch_all(&self, table: TableName) -> BoxFuture<'_, Vec<Row>>;

    /// Insert rows. Returns how many rows were inserted.
    fn insert_rows(&self, table: TableName, rows: Vec<Row>, options: InsertOptions) -> BoxFuture<'_, usize>;

    /// Update rows matched on `correlation` columns, writing only `targets`.
    fn update_rows(
        &self,
        table: TableName,
        correlation: Vec<String>,
        targets: Vec<String>,
        rows: Vec<Row>,
    ) -> BoxFuture<'_, usize>;

    /// Read a single table annotation.
    fn get_table_annotation(&self, table: TableName, tag: String) -> BoxFuture<'_, Option<Value>>;

    /// Write a single table annotation.
    fn put_table_annotation(&self, table: TableName, tag: String, value: Value) -> BoxFuture<'_, ()>;

    /// Replace one configuration field of a node.
    fn put_config(&self, node: NodePath, field: ConfigField, value: Value) -> BoxFuture<'_, ()>;

    /// Current snapshot marker of the catalog.
    fn latest_snapshot(&self) -> BoxFuture<'_, String>;

    /// Delete change history up to `snaptime`.
    fn truncate_history(&self, snaptime: String) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_display() {
        assert_eq!(ServiceError::Forbidden("x".into()).to_string(), "forbidden: x");
        assert_eq!(
            ServiceError::PreconditionFailed("etag".into()).to_string(),
            "precondition failed: etag"
        );
        assert!(ServiceError::Transport("reset".into()).to_string().contains("reset"));
    }

    #[test]
    fn test_insert_options_preserving() {
        let opts = InsertOptions::preserving(&["RID", "RCT", "RCB"]);
        assert_eq!(opts.nondefaults, vec!["RID", "RCT", "RCB"]);
        assert!(!opts.on_conflict_skip);
        assert!(opts.skip_conflicts().on_conflict_skip);
    }
}
