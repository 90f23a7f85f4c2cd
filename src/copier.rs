//! Resumable data copier.
//!
//! Moves rows of every scheduled table from source to destination, one
//! table at a time and one page at a time. The cursor comes from the
//! destination itself ([`RowCursor::resume`]); the progress marker is set
//! to Complete only after the last page has been accepted.
//!
//! # Design
//!
//! ```text
//!  dst.max_row_id ──▶ RowCursor
//!                        │
//!        ┌───────────────┴───────────────┐
//!        ▼                               │
//!  src.fetch_page(after = cursor) ──▶ empty? ──yes──▶ mark_complete
//!        │ no                            ▲
//!        ▼                               │
//!  cursor.advance(page)                  │
//!        ▼                               │
//!  dst.insert_rows(nondefaults RID,RCT,RCB)
//! ```
//!
//! [`PipelinedCopier`](crate::pipeline::PipelinedCopier) reuses the fetch and
//! upload primitives here, overlapping them with a bounded queue.

use crate::cursor::RowCursor;
use crate::error::{CloneError, Result};
use crate::marker::mark_complete;
use crate::metrics;
use crate::model::{Row, RowId, TableName, RCB, RCT, RID};
use crate::resilience::RateLimiter;
use crate::service::{CatalogService, InsertOptions};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

/// Invoked after each uploaded page with the table's cumulative row count.
pub type ProgressCallback = Arc<dyn Fn(&TableName, usize) + Send + Sync>;

/// Columns whose source values are kept on insert.
pub const PRESERVED_COLUMNS: [&str; 3] = [RID, RCT, RCB];

/// Result of one finished table copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCopy {
    pub table: TableName,
    /// Rows transferred by this run (not counting rows already present).
    pub rows: usize,
    pub pages: usize,
    pub resumed_from: Option<RowId>,
    pub duration: Duration,
}

/// Outcome of copying a set of tables.
#[derive(Debug, Default)]
pub struct CopySummary {
    pub completed: Vec<TableCopy>,
    pub failures: Vec<(TableName, CloneError)>,
}

impl CopySummary {
    pub fn rows_copied(&self) -> usize {
        self.completed.iter().map(|c| c.rows).sum()
    }

    pub fn failed_tables(&self) -> BTreeSet<TableName> {
        self.failures.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether the run was cancelled while copying.
    pub fn was_cancelled(&self) -> bool {
        self.failures.iter().any(|(_, e)| matches!(e, CloneError::Cancelled))
    }

    pub(crate) fn record(&mut self, table: TableName, result: Result<TableCopy>) {
        match result {
            Ok(copy) => {
                metrics::record_table_outcome(&table.to_string(), "complete");
                self.completed.push(copy);
            }
            Err(e) => {
                metrics::record_table_outcome(&table.to_string(), "failed");
                self.failures.push((table, e));
            }
        }
    }
}

/// Sequential copier over a source and destination service.
pub struct TableCopier<S: CatalogService, D: CatalogService> {
    src: Arc<S>,
    dst: Arc<D>,
    page_size: usize,
    limiter: Option<Arc<RateLimiter>>,
    progress: Option<ProgressCallback>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S: CatalogService, D: CatalogService> Clone for TableCopier<S, D> {
    fn clone(&self) -> Self {
        Self {
            src: Arc::clone(&self.src),
            dst: Arc::clone(&self.dst),
            page_size: self.page_size,
            limiter: self.limiter.clone(),
            progress: self.progress.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: CatalogService, D: CatalogService> TableCopier<S, D> {
    pub fn new(src: Arc<S>, dst: Arc<D>, page_size: usize) -> Self {
        Self {
            src,
            dst,
            page_size,
            limiter: None,
            progress: None,
            shutdown: None,
        }
    }

    /// Throttle source fetches through a shared limiter.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Stop at the next page boundary once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn shutdown_receiver(&self) -> Option<watch::Receiver<bool>> {
        self.shutdown.clone()
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        match &self.shutdown {
            Some(rx) if *rx.borrow() => Err(CloneError::Cancelled),
            _ => Ok(()),
        }
    }

    pub(crate) async fn resume_cursor(&self, table: &TableName) -> Result<RowCursor> {
        RowCursor::resume(self.dst.as_ref(), table).await
    }

    /// Fetch the page after `after`, honouring the rate limiter.
    pub(crate) async fn fetch(&self, table: &TableName, after: Option<RowId>) -> Result<Vec<Row>> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let start = Instant::now();
        let page = self
            .src
            .fetch_page(table.clone(), after, self.page_size)
            .await
            .map_err(|e| CloneError::transfer(table.to_string(), format!("page fetch failed: {e}")))?;
        metrics::record_page_fetched(&table.to_string(), page.len(), start.elapsed());
        debug!(table = %table, rows = page.len(), "Fetched page");
        Ok(page)
    }

    /// Upload one page preserving identifiers and creation metadata.
    pub(crate) async fn upload(&self, table: &TableName, page: Vec<Row>) -> Result<usize> {
        let rows = page.len();
        let start = Instant::now();
        self.dst
            .insert_rows(table.clone(), page, InsertOptions::preserving(&PRESERVED_COLUMNS))
            .await
            .map_err(|e| CloneError::transfer(table.to_string(), format!("page upload failed: {e}")))?;
        metrics::record_page_uploaded(&table.to_string(), rows, start.elapsed());
        debug!(table = %table, rows, "Uploaded page");
        Ok(rows)
    }

    pub(crate) fn report(&self, table: &TableName, rows: usize) {
        if let Some(progress) = &self.progress {
            progress(table, rows);
        }
    }

    pub(crate) async fn finish(&self, table: &TableName, cursor: &RowCursor, start: Instant) -> Result<TableCopy> {
        mark_complete(self.dst.as_ref(), table).await?;
        let duration = start.elapsed();
        metrics::record_table_duration(&table.to_string(), duration);
        info!(
            table = %table,
            rows = cursor.rows(),
            pages = cursor.pages(),
            elapsed_ms = duration.as_millis() as u64,
            "Table copy complete"
        );
        Ok(TableCopy {
            table: table.clone(),
            rows: cursor.rows(),
            pages: cursor.pages(),
            resumed_from: cursor.resumed_from().cloned(),
            duration,
        })
    }

    /// Copy one table from the destination's current cursor to the end.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn copy_table(&self, table: &TableName) -> Result<TableCopy> {
        let start = Instant::now();
        let mut cursor = self.resume_cursor(table).await?;
        if let Some(from) = cursor.resumed_from() {
            info!(cursor = %from, "Resuming table copy");
        }

        loop {
            self.check_cancelled()?;
            let page = self.fetch(table, cursor.position().cloned()).await?;
            if page.is_empty() {
                break;
            }
            cursor.advance(&page)?;
            self.upload(table, page).await?;
            self.report(table, cursor.rows());
        }

        self.finish(table, &cursor, start).await
    }

    /// Copy tables in order, collecting per-table failures.
    ///
    /// A transfer failure only affects its table; cancellation and other
    /// run-level errors stop the loop.
    pub async fn copy_all(&self, tables: &[TableName]) -> CopySummary {
        let mut summary = CopySummary::default();
        for table in tables {
            let result = self.copy_table(table).await;
            let stop = matches!(&result, Err(e) if e.is_fatal_for_run());
            if let Err(e) = &result {
                error!(table = %table, error = %e, "Table copy failed");
            }
            summary.record(table.clone(), result);
            if stop {
                break;
            }
        }
        summary
    }
}
