// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pipelined data copier.
//!
//! Same contract as [`TableCopier`]: rows after the destination's cursor
//! are moved page by page and the marker is set only at the end. Fetch and
//! upload overlap through a bounded queue, and several tables run at once
//! under a [`Bulkhead`].
//!
//! # Per-table pipeline
//!
//! ```text
//!   producer task                  bounded queue (depth)        consumer
//!  ┌──────────────┐  Page(rows)   ┌───┬───┬───┐   recv()   ┌──────────────┐
//!  │ fetch_page   │ ────────────▶ │   │   │   │ ─────────▶ │ insert_rows  │
//!  │ cursor++     │    End        └───┴───┴───┘            │ rows += n    │
//!  └──────┬───────┘                                        └──────┬───────┘
//!         │               cancel (watch<bool>)                    │
//!         └◀──────────────────────────────────────────────────────┘
//! ```
//!
//! - A full queue suspends the producer (backpressure).
//! - The queue is FIFO, so uploads happen in fetch order.
//! - Producer failure drops the sender: the consumer sees the queue close
//!   without `End` and stops.
//! - Consumer failure sets the cancel flag and closes the queue: a producer
//!   suspended in `fetch_page` or in `send` wakes up and exits.
//!
//! Neither side can be left waiting on the other.

use crate::copier::{CopySummary, TableCopier, TableCopy};
use crate::cursor::RowCursor;
use crate::error::{CloneError, Result};
use crate::metrics;
use crate::model::{Row, TableName};
use crate::resilience::Bulkhead;
use crate::service::CatalogService;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Item of the producer → consumer queue.
#[derive(Debug)]
enum PageMessage {
    Page(Vec<Row>),
    /// Source exhausted; no more pages follow.
    End,
}

/// What the consumer saw before stopping.
#[derive(Debug, Default)]
struct ConsumerReport {
    rows: usize,
    pages: usize,
    /// `End` was received.
    finished: bool,
}

/// Overlapped, fanned-out copier.
pub struct PipelinedCopier<S: CatalogService, D: CatalogService> {
    copier: TableCopier<S, D>,
    depth: usize,
    concurrency: usize,
}

impl<S: CatalogService, D: CatalogService> Clone for PipelinedCopier<S, D> {
    fn clone(&self) -> Self {
        Self {
            copier: self.copier.clone(),
            depth: self.depth,
            concurrency: self.concurrency,
        }
    }
}

impl<S: CatalogService, D: CatalogService> PipelinedCopier<S, D> {
    /// `depth` bounds queued pages per table, `concurrency` bounds tables in flight.
    pub fn new(copier: TableCopier<S, D>, depth: usize, concurrency: usize) -> Self {
        Self {
            copier,
            depth: depth.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Copy one table with overlapped fetch and upload.
    pub async fn copy_table(&self, table: &TableName) -> Result<TableCopy> {
        self.copier.check_cancelled()?;
        let start = Instant::now();
        let cursor = self.copier.resume_cursor(table).await?;
        if let Some(from) = cursor.resumed_from() {
            info!(table = %table, cursor = %from, "Resuming pipelined copy");
        }

        let (tx, mut rx) = mpsc::channel::<PageMessage>(self.depth);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let parent = self.copier.shutdown_receiver();

        let producer = tokio::spawn(
            produce(self.copier.clone(), table.clone(), cursor, tx, cancel_rx, parent.clone())
                .instrument(info_span!("producer", table = %table)),
        );

        let consumed = consume(&self.copier, table, &mut rx, parent)
            .instrument(info_span!("consumer", table = %table))
            .await;
        if consumed.is_err() {
            // Wake a producer blocked in fetch, fail any pending send, discard queued pages.
            let _ = cancel_tx.send(true);
            rx.close();
            while rx.try_recv().is_ok() {}
        }

        let produced = match producer.await {
            Ok(result) => result,
            Err(e) => Err(CloneError::Internal(format!("producer task failed: {e}"))),
        };

        let report = match consumed {
            Err(e) => return Err(pipeline_error(table, "consumer", e)),
            Ok(report) => report,
        };
        let cursor = produced.map_err(|e| pipeline_error(table, "producer", e))?;
        if !report.finished {
            return Err(pipeline_error(
                table,
                "consumer",
                CloneError::Internal("queue closed before end of table".into()),
            ));
        }
        debug!(table = %table, rows = report.rows, pages = report.pages, "Pipeline drained");
        self.copier.finish(table, &cursor, start).await
    }

    /// Copy many tables, at most `concurrency` at a time.
    ///
    /// Results are collected in completion order. One table's failure does
    /// not stop the others.
    pub async fn copy_all(&self, tables: &[TableName]) -> CopySummary {
        let bulkhead = Bulkhead::new(self.concurrency);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut set = JoinSet::new();
        let mut pending: BTreeSet<TableName> = tables.iter().cloned().collect();

        for table in tables {
            let this = self.clone();
            let bulkhead = bulkhead.clone();
            let in_flight = Arc::clone(&in_flight);
            let name = table.clone();
            let span = info_span!("table_copy", table = %table);
            set.spawn(
                async move {
                    let result = match bulkhead.acquire().await {
                        Ok(_permit) => {
                            metrics::set_tables_in_flight(in_flight.fetch_add(1, Ordering::SeqCst) + 1);
                            let result = this.copy_table(&name).await;
                            metrics::set_tables_in_flight(in_flight.fetch_sub(1, Ordering::SeqCst) - 1);
                            result
                        }
                        Err(e) => Err(e),
                    };
                    (name, result)
                }
                .instrument(span),
            );
        }

        let mut summary = CopySummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((table, result)) => {
                    pending.remove(&table);
                    if let Err(e) = &result {
                        error!(table = %table, error = %e, "Table copy failed");
                    }
                    summary.record(table, result);
                }
                Err(e) => warn!(error = %e, "Table copy task aborted"),
            }
        }
        for table in pending {
            summary.record(table, Err(CloneError::Internal("table copy task aborted".into())));
        }
        summary
    }
}

fn pipeline_error(table: &TableName, side: &str, e: CloneError) -> CloneError {
    match e {
        CloneError::Cancelled => CloneError::Cancelled,
        other => CloneError::Pipeline {
            table: table.to_string(),
            side: side.to_string(),
            message: other.to_string(),
        },
    }
}

/// Resolves once the flag is true. Never resolves if the sender is gone.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn cancelled(local: Option<&mut watch::Receiver<bool>>, parent: Option<&mut watch::Receiver<bool>>) {
    match (local, parent) {
        (Some(l), Some(p)) => tokio::select! {
            _ = wait_cancelled(l) => {}
            _ = wait_cancelled(p) => {}
        },
        (Some(rx), None) | (None, Some(rx)) => wait_cancelled(rx).await,
        (None, None) => std::future::pending::<()>().await,
    }
}

async fn produce<S: CatalogService, D: CatalogService>(
    copier: TableCopier<S, D>,
    table: TableName,
    mut cursor: RowCursor,
    tx: mpsc::Sender<PageMessage>,
    mut cancel: watch::Receiver<bool>,
    mut parent: Option<watch::Receiver<bool>>,
) -> Result<RowCursor> {
    loop {
        let page = tokio::select! {
            biased;
            _ = cancelled(Some(&mut cancel), parent.as_mut()) => return Err(CloneError::Cancelled),
            page = copier.fetch(&table, cursor.position().cloned()) => page?,
        };
        if page.is_empty() {
            // A closed queue here means the consumer already stopped.
            let _ = tx.send(PageMessage::End).await;
            return Ok(cursor);
        }
        cursor.advance(&page)?;
        if tx.send(PageMessage::Page(page)).await.is_err() {
            debug!(table = %table, "Queue closed, producer stopping");
            return Err(CloneError::Cancelled);
        }
    }
}

async fn consume<S: CatalogService, D: CatalogService>(
    copier: &TableCopier<S, D>,
    table: &TableName,
    rx: &mut mpsc::Receiver<PageMessage>,
    mut parent: Option<watch::Receiver<bool>>,
) -> Result<ConsumerReport> {
    let mut report = ConsumerReport::default();
    loop {
        let message = tokio::select! {
            biased;
            _ = cancelled(None, parent.as_mut()) => return Err(CloneError::Cancelled),
            message = rx.recv() => message,
        };
        match message {
            Some(PageMessage::Page(page)) => {
                report.rows += copier.upload(table, page).await?;
                report.pages += 1;
                copier.report(table, report.rows);
            }
            Some(PageMessage::End) => {
                report.finished = true;
                return Ok(report);
            }
            None => return Ok(report),
        }
    }
}
