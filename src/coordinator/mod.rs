// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Clone engine coordinator.
//!
//! The orchestrator that ties together:
//! - Model diffing via [`crate::diff::ModelDiffer`]
//! - Two-stage schema migration via [`crate::migrator::SchemaMigrator`]
//! - Row transfer via [`crate::copier::TableCopier`] or
//!   [`crate::pipeline::PipelinedCopier`]
//! - Identity registry merge via [`crate::reconcile`]
//! - Node configuration via [`crate::config_sync::ConfigSynchronizer`]
//!
//! # Run Sequence
//!
//! 1. Read both models, check that source policy is readable
//! 2. Apply catalog-level annotations and ACLs
//! 3. Diff, then stage 1 (everything but foreign keys)
//! 4. Copy rows of every table whose marker is Started
//! 5. Reconcile identity registries that were never scheduled
//! 6. Stage 2 (foreign keys whose tables finished copying)
//! 7. Apply configuration to every node
//! 8. Truncate destination history if nothing failed or is pending
//!
//! All restart state lives on the destination, so a failed or cancelled
//! run is resumed by constructing a new engine and running it again.

mod types;

pub use types::{ClonePhase, CloneProgress, CloneReport};

use crate::config::{CloneConfig, CopyMode};
use crate::config_sync::{ConfigSynchronizer, SyncOptions};
use crate::copier::{CopySummary, ProgressCallback, TableCopier};
use crate::diff::{DiffOptions, MigrationPlan, ModelDiffer, SkipReason, SkippedTable};
use crate::error::{CloneError, Result};
use crate::marker::ProgressMarker;
use crate::metrics;
use crate::migrator::SchemaMigrator;
use crate::model::{CatalogModel, TableName};
use crate::pipeline::PipelinedCopier;
use crate::reconcile::{reconcile_table, system_tables};
use crate::resilience::RateLimiter;
use crate::service::{CatalogService, ServiceError};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// One-shot, resumable catalog clone from `src` into `dst`.
///
/// The engine starts in [`ClonePhase::Created`]. [`run()`](Self::run) may be
/// called once; [`cancel()`](Self::cancel) may be called from another task
/// while it runs.
pub struct CloneEngine<S: CatalogService, D: CatalogService> {
    config: CloneConfig,
    src: Arc<S>,
    dst: Arc<D>,

    /// Phase (broadcast to watchers)
    phase_tx: watch::Sender<ClonePhase>,
    phase_rx: watch::Receiver<ClonePhase>,

    progress_tx: Arc<watch::Sender<CloneProgress>>,
    progress_rx: watch::Receiver<CloneProgress>,

    /// Per-table row callback supplied by the caller
    on_table: Option<ProgressCallback>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: CatalogService, D: CatalogService> CloneEngine<S, D> {
    pub fn new(config: CloneConfig, src: Arc<S>, dst: Arc<D>) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ClonePhase::Created);
        let (progress_tx, progress_rx) = watch::channel(CloneProgress::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            src,
            dst,
            phase_tx,
            phase_rx,
            progress_tx: Arc::new(progress_tx),
            progress_rx,
            on_table: None,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Call `callback(table, rows)` after every uploaded page.
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.on_table = Some(callback);
        self
    }

    pub fn config(&self) -> &CloneConfig {
        &self.config
    }

    pub fn phase(&self) -> ClonePhase {
        *self.phase_rx.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ClonePhase> {
        self.phase_rx.clone()
    }

    pub fn progress(&self) -> CloneProgress {
        self.progress_rx.borrow().clone()
    }

    pub fn progress_receiver(&self) -> watch::Receiver<CloneProgress> {
        self.progress_rx.clone()
    }

    /// Ask a running clone to stop at the next page boundary.
    pub fn cancel(&self) {
        info!("Clone cancellation requested");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CloneError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn transition(&self, phase: ClonePhase, message: impl Into<String>) {
        let message = message.into();
        info!(phase = %phase, "{message}");
        let _ = self.phase_tx.send(phase);
        metrics::set_clone_phase(&phase.to_string());
        self.progress_tx.send_modify(|p| {
            p.current_step = phase;
            p.percent_complete = phase.percent();
            p.message = message;
        });
    }

    /// Run the clone.
    ///
    /// Structural and authorization problems fail the run; per-table
    /// transfer failures are returned in the report.
    #[instrument(skip(self), fields(src = %self.src.name(), dst = %self.dst.name()))]
    pub async fn run(&self) -> Result<CloneReport> {
        let claimed = self.phase_tx.send_if_modified(|phase| {
            if *phase == ClonePhase::Created {
                *phase = ClonePhase::Preparing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(CloneError::InvalidState {
                expected: ClonePhase::Created.to_string(),
                actual: self.phase().to_string(),
            });
        }
        self.transition(ClonePhase::Preparing, "Starting catalog clone");

        match self.execute().await {
            Ok(report) => {
                self.transition(ClonePhase::Complete, "Catalog clone complete");
                info!(
                    tables = report.tables_copied,
                    rows = report.rows_copied,
                    failures = report.failures.len(),
                    pending_fkeys = report.pending_foreign_keys.len(),
                    "Clone finished"
                );
                Ok(report)
            }
            Err(CloneError::Cancelled) => {
                self.transition(ClonePhase::Cancelled, "Catalog clone cancelled");
                Err(CloneError::Cancelled)
            }
            Err(e) => {
                error!(error = %e, "Catalog clone failed");
                self.transition(ClonePhase::Failed, format!("Catalog clone failed: {e}"));
                Err(e)
            }
        }
    }

    async fn execute(&self) -> Result<CloneReport> {
        let started_at = Utc::now();
        self.config.validate()?;
        let root = self.config.root_table()?;

        let (src_model, dst_model) = futures::future::try_join(self.src.get_model(), self.dst.get_model())
            .await
            .map_err(|e: ServiceError| CloneError::service("read catalog models", e))?;
        if self.config.copy_policy && src_model.config.acls.is_empty() {
            return Err(CloneError::Authorization(format!(
                "catalog ACLs of {} are not readable; ownership is required to copy policy",
                self.src.name()
            )));
        }
        let source_digest = src_model.digest()?;

        let sync = ConfigSynchronizer::new(
            self.dst.as_ref(),
            SyncOptions::from(&self.config),
            self.config.config_sync.retry_config(),
        );
        let mut config_puts = sync.apply_catalog(&src_model).await?.puts;
        self.check_cancelled()?;

        self.transition(ClonePhase::Planning, "Diffing catalog models");
        let plan = ModelDiffer::new(DiffOptions::from(&self.config)).plan(&src_model, &dst_model)?;

        self.transition(ClonePhase::StageOne, "Creating schemas, tables, columns and keys");
        let migrator = SchemaMigrator::new(self.dst.as_ref());
        migrator.stage_one(&plan).await?;
        self.check_cancelled()?;

        let (tables, outside) = self.copy_set(&plan, &src_model, root.as_ref())?;
        let outside_names: Vec<TableName> = outside.iter().map(|t| t.name.clone()).collect();
        let mut skipped = plan.skipped().to_vec();
        skipped.extend(outside);
        self.progress_tx.send_modify(|p| p.total_tables = tables.len());
        self.transition(ClonePhase::CopyingData, format!("Copying {} tables", tables.len()));
        let mut summary = self.copy(&tables).await;
        if let Some(pos) = summary.failures.iter().position(|(_, e)| e.is_fatal_for_run()) {
            return Err(summary.failures.swap_remove(pos).1);
        }
        self.progress_tx.send_modify(|p| {
            p.tables_completed = summary.completed.len();
            p.rows_copied = summary.rows_copied();
            p.percent_complete = CloneProgress::copying_percent(summary.completed.len(), tables.len());
        });

        self.transition(ClonePhase::Reconciling, "Merging identity registries");
        self.reconcile_registries(&plan, &dst_model, &mut summary).await?;

        self.check_cancelled()?;
        self.transition(ClonePhase::StageTwo, "Adding foreign keys");
        // Tables left out by the subset hold no rows yet; their keys wait like failed ones.
        let mut incomplete = summary.failed_tables();
        incomplete.extend(outside_names);
        let stage_two = migrator.stage_two(&plan, &incomplete).await?;

        self.check_cancelled()?;
        self.transition(ClonePhase::SyncingConfig, "Applying node configuration");
        config_puts += sync.apply_all(&src_model).await?.puts;

        let settled = summary.is_clean() && stage_two.pending.is_empty();
        let truncated = if self.config.truncate_after && settled {
            self.transition(ClonePhase::Truncating, "Truncating destination history");
            self.truncate_history().await?;
            true
        } else {
            if !settled {
                warn!(
                    failures = summary.failures.len(),
                    pending_fkeys = stage_two.pending.len(),
                    "Skipping history truncation, clone is not settled"
                );
            }
            false
        };

        Ok(CloneReport {
            started_at,
            finished_at: Utc::now(),
            source_digest,
            tables_copied: summary.completed.len(),
            rows_copied: summary.rows_copied(),
            skipped,
            pending_foreign_keys: stage_two.pending,
            config_puts,
            truncated,
            failures: summary.failures,
        })
    }

    /// Tables whose rows move in this run, plus those left out by `root`.
    fn copy_set(
        &self,
        plan: &MigrationPlan,
        src_model: &CatalogModel,
        root: Option<&TableName>,
    ) -> Result<(Vec<TableName>, Vec<SkippedTable>)> {
        let mut tables = plan.tables_to_copy();
        let mut outside = Vec::new();
        if !self.config.copy_data {
            return Ok((Vec::new(), outside));
        }
        if let Some(root) = root {
            if src_model.table(root).is_none() {
                return Err(CloneError::configuration(root.to_string(), "root table does not exist in the source"));
            }
            let connected = src_model.connected_tables(root);
            tables.retain(|t| {
                let keep = connected.contains(t);
                if !keep {
                    outside.push(SkippedTable {
                        name: t.clone(),
                        reason: SkipReason::OutsideSubset,
                    });
                }
                keep
            });
            info!(root = %root, tables = tables.len(), skipped = outside.len(), "Data copy restricted to connected tables");
        }
        Ok((tables, outside))
    }

    fn copier(&self) -> TableCopier<S, D> {
        let rows_by_table: Arc<DashMap<TableName, usize>> = Arc::new(DashMap::new());
        let progress_tx = Arc::clone(&self.progress_tx);
        let on_table = self.on_table.clone();
        let progress: ProgressCallback = Arc::new(move |table: &TableName, rows: usize| {
            rows_by_table.insert(table.clone(), rows);
            let total: usize = rows_by_table.iter().map(|e| *e.value()).sum();
            progress_tx.send_modify(|p| p.rows_copied = total);
            if let Some(callback) = &on_table {
                callback(table, rows);
            }
        });

        let mut copier = TableCopier::new(Arc::clone(&self.src), Arc::clone(&self.dst), self.config.copy.page_size)
            .with_progress(progress)
            .with_shutdown(self.shutdown_rx.clone());
        if let Some(rate) = self.config.copy.fetch_rate() {
            info!(pages_per_sec = rate.get(), "Source fetches throttled");
            copier = copier.with_rate_limiter(Arc::new(RateLimiter::per_second(rate)));
        }
        copier
    }

    async fn copy(&self, tables: &[TableName]) -> CopySummary {
        if tables.is_empty() {
            return CopySummary::default();
        }
        let copier = self.copier();
        match self.config.copy.mode {
            CopyMode::Sequential => copier.copy_all(tables).await,
            CopyMode::Pipelined => {
                PipelinedCopier::new(copier, self.config.copy.pipeline_depth, self.config.copy.table_concurrency)
                    .copy_all(tables)
                    .await
            }
        }
    }

    /// Merge registries that exist on both sides but were never scheduled.
    async fn reconcile_registries(
        &self,
        plan: &MigrationPlan,
        dst_model: &CatalogModel,
        summary: &mut CopySummary,
    ) -> Result<()> {
        if !self.config.copy_data {
            return Ok(());
        }
        for table in system_tables() {
            let unscheduled = plan
                .table(&table)
                .is_some_and(|t| t.marker == ProgressMarker::Unscheduled);
            if !unscheduled || dst_model.table(&table).is_none() {
                continue;
            }
            self.check_cancelled()?;
            match reconcile_table(self.src.as_ref(), self.dst.as_ref(), &table).await {
                Ok(_) => {}
                Err(e) if e.is_fatal_for_run() => return Err(e),
                Err(e) => {
                    error!(table = %table, error = %e, "Reconciliation failed");
                    metrics::record_table_outcome(&table.to_string(), "failed");
                    summary.failures.push((table, e));
                }
            }
        }
        Ok(())
    }

    async fn truncate_history(&self) -> Result<()> {
        let snaptime = self
            .dst
            .latest_snapshot()
            .await
            .map_err(|e| CloneError::service("read latest snapshot", e))?;
        self.dst
            .truncate_history(snaptime.clone())
            .await
            .map_err(|e| CloneError::service(format!("truncate history to {snaptime}"), e))?;
        metrics::record_history_truncated();
        info!(snaptime = %snaptime, "Destination history truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::{read_marker, CLONE_STATE_TAG};
    use crate::memory::{MemoryCatalog, ServiceCall};
    use crate::model::RID;
    use crate::testing::*;
    use serde_json::json;

    fn parent() -> TableName {
        TableName::new("isa", "parent")
    }

    fn child() -> TableName {
        TableName::new("isa", "child")
    }

    fn seeded_source() -> Arc<MemoryCatalog> {
        let src = Arc::new(MemoryCatalog::with_model("src", parent_child_model()));
        src.seed_rows(&parent(), rows(&["1", "2", "3"]));
        src.seed_rows(
            &child(),
            vec![
                row("4", &[("parent", json!("1")), ("note", json!("a"))]),
                row("5", &[("parent", json!("2")), ("note", json!("b"))]),
            ],
        );
        src
    }

    fn engine(src: Arc<MemoryCatalog>, dst: Arc<MemoryCatalog>) -> CloneEngine<MemoryCatalog, MemoryCatalog> {
        CloneEngine::new(CloneConfig::for_testing(), src, dst)
    }

    #[test]
    fn test_engine_initial_state() {
        let e = engine(seeded_source(), Arc::new(MemoryCatalog::new("dst")));
        assert_eq!(e.phase(), ClonePhase::Created);
        assert_eq!(*e.phase_receiver().borrow(), ClonePhase::Created);
        assert_eq!(e.progress(), CloneProgress::default());
        assert!(!e.is_cancelled());
    }

    #[tokio::test]
    async fn test_clone_into_empty_destination() {
        let src = seeded_source();
        let dst = Arc::new(MemoryCatalog::new("dst"));
        let e = engine(Arc::clone(&src), Arc::clone(&dst));

        let report = e.run().await.unwrap();
        assert_eq!(e.phase(), ClonePhase::Complete);
        assert_eq!(report.tables_copied, 2);
        assert_eq!(report.rows_copied, 5);
        assert!(report.is_complete());
        assert!(report.truncated);
        assert_eq!(report.source_digest, src.model().await.digest().unwrap());

        assert_eq!(rids(&dst.rows(&parent())), vec!["1", "2", "3"]);
        assert_eq!(rids(&dst.rows(&child())), vec!["4", "5"]);
        assert_eq!(read_marker(dst.as_ref(), &child()).await.unwrap(), ProgressMarker::Complete);
        let model = dst.model().await;
        assert_eq!(model.table(&child()).unwrap().foreign_keys.len(), 1);
        assert_eq!(model.config.acls.get("owner"), Some(&json!(["admin"])));

        let progress = e.progress();
        assert_eq!(progress.current_step, ClonePhase::Complete);
        assert_eq!(progress.rows_copied, 5);
        assert_eq!(progress.percent_complete, 100);
    }

    #[tokio::test]
    async fn test_run_twice_is_invalid_state() {
        let e = engine(seeded_source(), Arc::new(MemoryCatalog::new("dst")));
        e.run().await.unwrap();
        match e.run().await {
            Err(CloneError::InvalidState { expected, actual }) => {
                assert_eq!(expected, "Created");
                assert_eq!(actual, "Complete");
            }
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreadable_source_policy_fails_before_mutation() {
        let mut model = parent_child_model();
        model.config.acls.clear();
        let src = Arc::new(MemoryCatalog::with_model("src", model));
        let dst = Arc::new(MemoryCatalog::new("dst"));
        let e = engine(src, Arc::clone(&dst));

        let err = e.run().await.unwrap_err();
        assert!(matches!(err, CloneError::Authorization(_)));
        assert_eq!(e.phase(), ClonePhase::Failed);
        assert!(dst
            .calls()
            .iter()
            .all(|c| matches!(c, ServiceCall::GetModel)));
    }

    #[tokio::test]
    async fn test_copy_data_off_creates_structure_only() {
        let dst = Arc::new(MemoryCatalog::new("dst"));
        let config = CloneConfig {
            copy_data: false,
            ..CloneConfig::for_testing()
        };
        let report = CloneEngine::new(config, seeded_source(), Arc::clone(&dst))
            .run()
            .await
            .unwrap();
        assert_eq!(report.rows_copied, 0);
        assert_eq!(dst.row_count(&parent()), 0);
        let model = dst.model().await;
        let table = model.table(&child()).unwrap();
        assert_eq!(table.foreign_keys.len(), 1);
        assert_eq!(table.config.annotations.get(CLONE_STATE_TAG), Some(&json!(null)));
    }

    #[tokio::test]
    async fn test_cancel_before_run_stops_after_preparing() {
        let dst = Arc::new(MemoryCatalog::new("dst"));
        let e = engine(seeded_source(), Arc::clone(&dst));
        e.cancel();
        let err = e.run().await.unwrap_err();
        assert!(matches!(err, CloneError::Cancelled));
        assert_eq!(e.phase(), ClonePhase::Cancelled);
        assert_eq!(dst.row_count(&parent()), 0);
    }

    #[tokio::test]
    async fn test_progress_callback_sees_every_table() {
        let seen: Arc<DashMap<TableName, usize>> = Arc::new(DashMap::new());
        let sink = Arc::clone(&seen);
        let e = engine(seeded_source(), Arc::new(MemoryCatalog::new("dst"))).with_progress_callback(Arc::new(
            move |table: &TableName, rows: usize| {
                sink.insert(table.clone(), rows);
            },
        ));
        e.run().await.unwrap();
        assert_eq!(seen.get(&parent()).map(|r| *r), Some(3));
        assert_eq!(seen.get(&child()).map(|r| *r), Some(2));
    }

    #[tokio::test]
    async fn test_missing_root_table_is_configuration_error() {
        let config = CloneConfig {
            root_table: Some("isa:nowhere".into()),
            ..CloneConfig::for_testing()
        };
        let e = CloneEngine::new(config, seeded_source(), Arc::new(MemoryCatalog::new("dst")));
        assert!(matches!(e.run().await, Err(CloneError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_sequential_mode_matches_pipelined() {
        let dst = Arc::new(MemoryCatalog::new("dst"));
        let mut config = CloneConfig::for_testing();
        config.copy.mode = CopyMode::Sequential;
        let report = CloneEngine::new(config, seeded_source(), Arc::clone(&dst))
            .run()
            .await
            .unwrap();
        assert_eq!(report.rows_copied, 5);
        let child_rows = dst.rows(&child());
        assert!(child_rows.iter().all(|r| r.contains_key(RID)));
    }
}
