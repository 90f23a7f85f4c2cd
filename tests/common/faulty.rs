//! Fault-injecting catalog wrapper.
//!
//! [`FaultyCatalog`] delegates to a [`MemoryCatalog`] and fails row fetches
//! or inserts once a call budget is spent, simulating a connection lost
//! mid-copy. Fetches can also be refused for chosen tables only.
//! Everything else passes through untouched.

use catalog_replication::model::{CatalogModel, Column, ConfigField, ForeignKey, Key, NodePath, Row, RowId, SchemaObject, TableName};
use catalog_replication::service::BoxFuture;
use catalog_replication::{CatalogService, InsertOptions, MemoryCatalog, ServiceError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct FaultyCatalog {
    inner: Arc<MemoryCatalog>,
    fetch_budget: AtomicUsize,
    insert_budget: AtomicUsize,
    broken_tables: Mutex<BTreeSet<TableName>>,
    fetch_delay: Option<Duration>,
}

impl FaultyCatalog {
    pub fn new(inner: Arc<MemoryCatalog>) -> Self {
        Self {
            inner,
            fetch_budget: AtomicUsize::new(usize::MAX),
            insert_budget: AtomicUsize::new(usize::MAX),
            broken_tables: Mutex::new(BTreeSet::new()),
            fetch_delay: None,
        }
    }

    /// Let `n` page fetches succeed, fail the rest.
    pub fn fail_fetches_after(self, n: usize) -> Self {
        self.fetch_budget.store(n, Ordering::SeqCst);
        self
    }

    /// Let `n` inserts succeed, fail the rest.
    pub fn fail_inserts_after(self, n: usize) -> Self {
        self.insert_budget.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every page fetch from `table`.
    pub fn fail_fetches_for(self, table: TableName) -> Self {
        self.broken_tables.lock().unwrap().insert(table);
        self
    }

    /// Sleep before every page fetch.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn inner(&self) -> &Arc<MemoryCatalog> {
        &self.inner
    }

    /// Lift every limit, as if the connection came back.
    pub fn heal(&self) {
        self.fetch_budget.store(usize::MAX, Ordering::SeqCst);
        self.insert_budget.store(usize::MAX, Ordering::SeqCst);
        self.broken_tables.lock().unwrap().clear();
    }

    fn spend(budget: &AtomicUsize) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl CatalogService for FaultyCatalog {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_model(&self) -> BoxFuture<'_, CatalogModel> {
        self.inner.get_model()
    }

    fn post_schema_objects(&self, objects: Vec<SchemaObject>) -> BoxFuture<'_, ()> {
        self.inner.post_schema_objects(objects)
    }

    fn post_column(&self, table: TableName, column: Column) -> BoxFuture<'_, ()> {
        self.inner.post_column(table, column)
    }

    fn post_key(&self, table: TableName, key: Key) -> BoxFuture<'_, ()> {
        self.inner.post_key(table, key)
    }

    fn post_foreign_keys(&self, fkeys: Vec<(TableName, ForeignKey)>) -> BoxFuture<'_, ()> {
        self.inner.post_foreign_keys(fkeys)
    }

    fn max_row_id(&self, table: TableName) -> BoxFuture<'_, Option<RowId>> {
        self.inner.max_row_id(table)
    }

    fn fetch_page(&self, table: TableName, after: Option<RowId>, limit: usize) -> BoxFuture<'_, Vec<Row>> {
        Box::pin(async move {
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            let broken = self.broken_tables.lock().unwrap().contains(&table);
            if broken || !Self::spend(&self.fetch_budget) {
                return Err(ServiceError::Transport(format!("connection reset fetching {table}")));
            }
            self.inner.fetch_page(table, after, limit).await
        })
    }

    fn fetch_all(&self, table: TableName) -> BoxFuture<'_, Vec<Row>> {
        self.inner.fetch_all(table)
    }

    fn insert_rows(&self, table: TableName, rows: Vec<Row>, options: InsertOptions) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            if !Self::spend(&self.insert_budget) {
                return Err(ServiceError::Transport(format!("connection reset inserting into {table}")));
            }
            self.inner.insert_rows(table, rows, options).await
        })
    }

    fn update_rows(
        &self,
        table: TableName,
        correlation: Vec<String>,
        targets: Vec<String>,
        rows: Vec<Row>,
    ) -> BoxFuture<'_, usize> {
        self.inner.update_rows(table, correlation, targets, rows)
    }

    fn get_table_annotation(&self, table: TableName, tag: String) -> BoxFuture<'_, Option<Value>> {
        self.inner.get_table_annotation(table, tag)
    }

    fn put_table_annotation(&self, table: TableName, tag: String, value: Value) -> BoxFuture<'_, ()> {
        self.inner.put_table_annotation(table, tag, value)
    }

    fn put_config(&self, node: NodePath, field: ConfigField, value: Value) -> BoxFuture<'_, ()> {
        self.inner.put_config(node, field, value)
    }

    fn latest_snapshot(&self) -> BoxFuture<'_, String> {
        self.inner.latest_snapshot()
    }

    fn truncate_history(&self, snaptime: String) -> BoxFuture<'_, ()> {
        self.inner.truncate_history(snaptime)
    }
}
