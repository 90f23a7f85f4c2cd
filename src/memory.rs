// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory catalog service.
//!
//! [`MemoryCatalog`] implements [`CatalogService`] over a model held in
//! memory and per-table row maps ordered by RID. It enforces the behaviors
//! the engine relies on:
//!
//! - RIDs are preserved when listed in `nondefaults`, generated otherwise
//! - duplicate values of any table key are rejected, or skipped when
//!   `on_conflict_skip` is set
//! - foreign keys are only accepted when they reference a key and every
//!   existing referring value resolves
//! - every call is recorded in a call log for assertions
//!
//! It backs unit and integration tests and is usable as a local sink.

use crate::model::{
    row_id, CatalogModel, Column, ConfigField, ForeignKey, Key, NodePath, Row, RowId, SchemaObject,
    Table, TableName, RCB, RCT, RID, RMB, RMT,
};
use crate::service::{BoxFuture, CatalogService, InsertOptions, ServiceError, ServiceResult};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::trace;

/// One recorded service call.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    GetModel,
    PostSchemaObjects(Vec<String>),
    PostColumn(TableName, String),
    PostKey(TableName, Vec<String>),
    PostForeignKeys(usize),
    MaxRowId(TableName),
    FetchPage {
        table: TableName,
        after: Option<RowId>,
        limit: usize,
    },
    FetchAll(TableName),
    InsertRows {
        table: TableName,
        rows: usize,
        options: InsertOptions,
    },
    UpdateRows {
        table: TableName,
        rows: usize,
    },
    GetTableAnnotation(TableName, String),
    PutTableAnnotation(TableName, String, Value),
    PutConfig(NodePath, ConfigField),
    LatestSnapshot,
    TruncateHistory(String),
}

type RowMap = BTreeMap<RowId, Row>;

/// In-memory [`CatalogService`].
pub struct MemoryCatalog {
    name: String,
    model: RwLock<CatalogModel>,
    rows: DashMap<TableName, RowMap>,
    calls: Mutex<Vec<ServiceCall>>,
    version: AtomicU64,
    rid_seq: AtomicU64,
    concurrent_updates: AtomicUsize,
}

impl MemoryCatalog {
    /// Empty catalog.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_model(name, CatalogModel::default())
    }

    /// Catalog with the given model and empty tables.
    pub fn with_model(name: impl Into<String>, model: CatalogModel) -> Self {
        let rows = DashMap::new();
        for table in model.tables() {
            rows.insert(table.name(), RowMap::new());
        }
        Self {
            name: name.into(),
            model: RwLock::new(model),
            rows,
            calls: Mutex::new(Vec::new()),
            version: AtomicU64::new(1),
            rid_seq: AtomicU64::new(0),
            concurrent_updates: AtomicUsize::new(0),
        }
    }

    /// Load rows directly, bypassing the call log and key checks.
    pub fn seed_rows(&self, table: &TableName, rows: Vec<Row>) {
        let mut map = self.rows.entry(table.clone()).or_default();
        for row in rows {
            if let Some(rid) = row_id(&row) {
                map.insert(rid, row);
            }
        }
    }

    /// Rows of a table in RID order.
    pub fn rows(&self, table: &TableName) -> Vec<Row> {
        self.rows
            .get(table)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &TableName) -> usize {
        self.rows.get(table).map(|m| m.len()).unwrap_or(0)
    }

    /// Snapshot of the current model.
    pub async fn model(&self) -> CatalogModel {
        self.model.read().await.clone()
    }

    /// Replace the model, keeping rows of tables that still exist.
    pub async fn set_model(&self, model: CatalogModel) {
        for table in model.tables() {
            self.rows.entry(table.name()).or_default();
        }
        *self.model.write().await = model;
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of configuration PUTs recorded.
    pub fn config_put_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ServiceCall::PutConfig(..)))
            .count()
    }

    /// Make the next `n` configuration PUTs fail with a precondition error.
    pub fn inject_concurrent_updates(&self, n: usize) {
        self.concurrent_updates.store(n, Ordering::SeqCst);
    }

    fn record(&self, call: ServiceCall) {
        trace!(catalog = %self.name, ?call, "service call");
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn next_rid(&self) -> RowId {
        let n = self.rid_seq.fetch_add(1, Ordering::SeqCst) + 1;
        RowId::new(format!("M-{n:06}"))
    }

    fn take_injected_conflict(&self) -> bool {
        self.concurrent_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn not_found(table: &TableName) -> ServiceError {
    ServiceError::NotFound(format!("table {table}"))
}

/// Key values of `row` as JSON text, `None` if any is missing or null.
fn key_tuple(row: &Row, columns: &[String]) -> Option<Vec<String>> {
    columns
        .iter()
        .map(|c| row.get(c).filter(|v| !v.is_null()).map(Value::to_string))
        .collect()
}

/// Referenced-column names of a foreign key ordered to match its referring columns.
fn fk_column_pairs(fk: &ForeignKey) -> (Vec<String>, Vec<String>) {
    fk.foreign_key_columns
        .iter()
        .zip(&fk.referenced_columns)
        .map(|(f, r)| (f.column_name.clone(), r.column_name.clone()))
        .unzip()
}

fn check_foreign_key(
    model: &CatalogModel,
    rows: &DashMap<TableName, RowMap>,
    table: &TableName,
    fk: &ForeignKey,
) -> ServiceResult<()> {
    let target_name = fk
        .referenced_table()
        .ok_or_else(|| ServiceError::Conflict("foreign key without referenced columns".into()))?;
    let target = model.table(&target_name).ok_or_else(|| not_found(&target_name))?;
    let mut referenced: Vec<String> = fk.referenced_columns.iter().map(|c| c.column_name.clone()).collect();
    referenced.sort();
    if target.key(&referenced).is_none() {
        return Err(ServiceError::Conflict(format!(
            "referenced columns of {target_name} are not a key"
        )));
    }

    let (from_cols, to_cols) = fk_column_pairs(fk);
    let known: BTreeSet<Vec<String>> = rows
        .get(&target_name)
        .map(|m| m.values().filter_map(|r| key_tuple(r, &to_cols)).collect())
        .unwrap_or_default();
    if let Some(referring) = rows.get(table) {
        for row in referring.values() {
            if let Some(tuple) = key_tuple(row, &from_cols) {
                if !known.contains(&tuple) {
                    return Err(ServiceError::Conflict(format!(
                        "{table} row {} references missing {target_name} row",
                        row_id(row).map(|r| r.0).unwrap_or_default()
                    )));
                }
            }
        }
    }
    Ok(())
}

impl CatalogService for MemoryCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_model(&self) -> BoxFuture<'_, CatalogModel> {
        Box::pin(async move {
            self.record(ServiceCall::GetModel);
            Ok(self.model.read().await.clone())
        })
    }

    fn post_schema_objects(&self, objects: Vec<SchemaObject>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(ServiceCall::PostSchemaObjects(
                objects.iter().map(SchemaObject::describe).collect(),
            ));
            let mut model = self.model.write().await;
            let mut staged = model.clone();
            let mut tables: Vec<Table> = Vec::new();
            for obj in objects {
                match obj {
                    SchemaObject::Schema(s) => {
                        if staged.schemas.contains_key(&s.schema_name) {
                            return Err(ServiceError::Conflict(format!("schema {} exists", s.schema_name)));
                        }
                        let inline = s.tables.values().cloned().collect::<Vec<_>>();
                        staged.schemas.insert(s.schema_name.clone(), s.without_tables());
                        tables.extend(inline);
                    }
                    SchemaObject::Table(t) => tables.push(t),
                }
            }
            for table in &tables {
                let name = table.name();
                let schema = staged
                    .schemas
                    .get_mut(&name.schema)
                    .ok_or_else(|| ServiceError::NotFound(format!("schema {}", name.schema)))?;
                if schema.tables.contains_key(&name.table) {
                    return Err(ServiceError::Conflict(format!("table {name} exists")));
                }
                schema.tables.insert(name.table.clone(), table.clone());
            }
            for table in &tables {
                for fk in &table.foreign_keys {
                    check_foreign_key(&staged, &self.rows, &table.name(), fk)?;
                }
            }
            for table in &tables {
                self.rows.entry(table.name()).or_default();
            }
            *model = staged;
            self.bump();
            Ok(())
        })
    }

    fn post_column(&self, table: TableName, column: Column) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(ServiceCall::PostColumn(table.clone(), column.name.clone()));
            let mut model = self.model.write().await;
            let t = model.table_mut(&table).ok_or_else(|| not_found(&table))?;
            if t.column(&column.name).is_some() {
                return Err(ServiceError::Conflict(format!("column {table}:{} exists", column.name)));
            }
            t.column_definitions.push(column);
            self.bump();
            Ok(())
        })
    }

    fn post_key(&self, table: TableName, key: Key) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(ServiceCall::PostKey(table.clone(), key.identity()));
            let mut model = self.model.write().await;
            let t = model.table_mut(&table).ok_or_else(|| not_found(&table))?;
            if t.key(&key.identity()).is_some() {
                return Err(ServiceError::Conflict(format!("key on {table} exists")));
            }
            t.keys.push(key);
            self.bump();
            Ok(())
        })
    }

    fn post_foreign_keys(&self, fkeys: Vec<(TableName, ForeignKey)>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(ServiceCall::PostForeignKeys(fkeys.len()));
            let mut model = self.model.write().await;
            for (table, fk) in &fkeys {
                if model.table(table).is_none() {
                    return Err(not_found(table));
                }
                check_foreign_key(&model, &self.rows, table, fk)?;
            }
            for (table, fk) in fkeys {
                if let Some(t) = model.table_mut(&table) {
                    if t.foreign_key(&fk.identity()).is_none() {
                        t.foreign_keys.push(fk);
                    }
                }
            }
            self.bump();
            Ok(())
        })
    }

    fn max_row_id(&self, table: TableName) -> BoxFuture<'_, Option<RowId>> {
        Box::pin(async move {
            self.record(ServiceCall::MaxRowId(table.clone()));
            let rows = self.rows.get(&table).ok_or_else(|| not_found(&table))?;
            Ok(rows.keys().next_back().cloned())
        })
    }

    fn fetch_page(&self, table: TableName, after: Option<RowId>, limit: usize) -> BoxFuture<'_, Vec<Row>> {
        Box::pin(async move {
            self.record(ServiceCall::FetchPage {
                table: table.clone(),
                after: after.clone(),
                limit,
            });
            let rows = self.rows.get(&table).ok_or_else(|| not_found(&table))?;
            let page = match after {
                Some(cursor) => rows
                    .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded))
                    .take(limit)
                    .map(|(_, r)| r.clone())
                    .collect(),
                None => rows.values().take(limit).cloned().collect(),
            };
            Ok(page)
        })
    }

    fn fetch_all(&self, table: TableName) -> BoxFuture<'_, Vec<Row>> {
        Box::pin(async move {
            self.record(ServiceCall::FetchAll(table.clone()));
            let rows = self.rows.get(&table).ok_or_else(|| not_found(&table))?;
            Ok(rows.values().cloned().collect())
        })
    }

    fn insert_rows(&self, table: TableName, rows: Vec<Row>, options: InsertOptions) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            self.record(ServiceCall::InsertRows {
                table: table.clone(),
                rows: rows.len(),
                options: options.clone(),
            });
            let keys: Vec<Vec<String>> = {
                let model = self.model.read().await;
                let t = model.table(&table).ok_or_else(|| not_found(&table))?;
                t.keys.iter().map(|k| k.unique_columns.clone()).collect()
            };
            let mut existing = self.rows.get_mut(&table).ok_or_else(|| not_found(&table))?;
            let mut taken: Vec<BTreeSet<Vec<String>>> = keys
                .iter()
                .map(|cols| existing.values().filter_map(|r| key_tuple(r, cols)).collect())
                .collect();

            let preserve = |col: &str| options.nondefaults.iter().any(|c| c == col);
            let now = Value::String(chrono::Utc::now().to_rfc3339());
            let mut accepted = Vec::with_capacity(rows.len());
            for mut row in rows {
                let rid = match row_id(&row) {
                    Some(rid) if preserve(RID) => rid,
                    _ => self.next_rid(),
                };
                row.insert(RID.to_string(), Value::String(rid.0.clone()));
                if !preserve(RCT) {
                    row.insert(RCT.to_string(), now.clone());
                }
                if !preserve(RCB) {
                    row.insert(RCB.to_string(), Value::String(self.name.clone()));
                }
                row.insert(RMT.to_string(), now.clone());
                row.insert(RMB.to_string(), Value::String(self.name.clone()));

                let tuples: Vec<Option<Vec<String>>> = keys.iter().map(|cols| key_tuple(&row, cols)).collect();
                let conflict = existing.contains_key(&rid)
                    || tuples
                        .iter()
                        .zip(&taken)
                        .any(|(t, seen)| t.as_ref().is_some_and(|t| seen.contains(t)));
                if conflict {
                    if options.on_conflict_skip {
                        continue;
                    }
                    return Err(ServiceError::Conflict(format!("duplicate key in {table} for row {rid}")));
                }
                for (t, seen) in tuples.into_iter().zip(taken.iter_mut()) {
                    if let Some(t) = t {
                        seen.insert(t);
                    }
                }
                accepted.push((rid, row));
            }

            let count = accepted.len();
            existing.extend(accepted);
            drop(existing);
            self.bump();
            Ok(count)
        })
    }

    fn update_rows(
        &self,
        table: TableName,
        correlation: Vec<String>,
        targets: Vec<String>,
        rows: Vec<Row>,
    ) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            self.record(ServiceCall::UpdateRows {
                table: table.clone(),
                rows: rows.len(),
            });
            let mut existing = self.rows.get_mut(&table).ok_or_else(|| not_found(&table))?;
            let now = Value::String(chrono::Utc::now().to_rfc3339());
            let mut updated = 0;
            for row in rows {
                let Some(wanted) = key_tuple(&row, &correlation) else {
                    continue;
                };
                let target = existing
                    .values_mut()
                    .find(|r| key_tuple(r, &correlation).as_ref() == Some(&wanted));
                if let Some(target) = target {
                    for col in &targets {
                        target.insert(col.clone(), row.get(col).cloned().unwrap_or(Value::Null));
                    }
                    target.insert(RMT.to_string(), now.clone());
                    updated += 1;
                }
            }
            drop(existing);
            self.bump();
            Ok(updated)
        })
    }

    fn get_table_annotation(&self, table: TableName, tag: String) -> BoxFuture<'_, Option<Value>> {
        Box::pin(async move {
            self.record(ServiceCall::GetTableAnnotation(table.clone(), tag.clone()));
            let model = self.model.read().await;
            let t = model.table(&table).ok_or_else(|| not_found(&table))?;
            Ok(t.config.annotations.get(&tag).cloned())
        })
    }

    fn put_table_annotation(&self, table: TableName, tag: String, value: Value) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(ServiceCall::PutTableAnnotation(table.clone(), tag.clone(), value.clone()));
            let mut model = self.model.write().await;
            let t = model.table_mut(&table).ok_or_else(|| not_found(&table))?;
            t.config.annotations.insert(tag, value);
            self.bump();
            Ok(())
        })
    }

    fn put_config(&self, node: NodePath, field: ConfigField, value: Value) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(ServiceCall::PutConfig(node.clone(), field));
            if self.take_injected_conflict() {
                return Err(ServiceError::PreconditionFailed(format!("{node} changed concurrently")));
            }
            let mut model = self.model.write().await;
            let config = model
                .config_mut(&node)
                .ok_or_else(|| ServiceError::NotFound(node.to_string()))?;
            config
                .set_field(field, value)
                .map_err(|e| ServiceError::Conflict(format!("{node} {field}: {e}")))?;
            self.bump();
            Ok(())
        })
    }

    fn latest_snapshot(&self) -> BoxFuture<'_, String> {
        Box::pin(async move {
            self.record(ServiceCall::LatestSnapshot);
            Ok(format!("{}T", self.version.load(Ordering::SeqCst)))
        })
    }

    fn truncate_history(&self, snaptime: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(ServiceCall::TruncateHistory(snaptime));
            Ok(())
        })
    }
}
