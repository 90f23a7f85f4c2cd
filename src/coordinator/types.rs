//! Engine state and report types.
//!
//! # Phase Transitions
//!
//! ```text
//!            run()
//! Created ─────────→ Preparing ──→ Planning ──→ StageOne ──→ CopyingData
//!                        │             │            │              │
//!                        │             │            │              ↓
//!                        │             │            │         Reconciling
//!                        │             │            │              │
//!                        ↓             ↓            ↓              ↓
//!                     Failed ←─────────┴────────────┴─────────  StageTwo
//!                        ↑                                         │
//!                        │                                         ↓
//!                        └──────────── Truncating ←──────── SyncingConfig
//!                                          │
//!                                          ↓
//!                                      Complete
//!
//! cancel() from any running phase ──→ Cancelled
//! ```
//!
//! # Phase Descriptions
//!
//! - **Created**: initial state after `CloneEngine::new()`.
//! - **Preparing**: both models read, catalog ACLs checked and applied.
//! - **Planning**: models diffed into a migration plan.
//! - **StageOne**: schemas, tables, columns and keys created.
//! - **CopyingData**: rows moved for every scheduled table.
//! - **Reconciling**: identity registries merged.
//! - **StageTwo**: deferred foreign keys added.
//! - **SyncingConfig**: comments, annotations and policy applied per node.
//! - **Truncating**: destination history truncated.
//! - **Complete** / **Failed** / **Cancelled**: terminal.

use crate::error::CloneError;
use crate::model::{ForeignKey, TableName};
use crate::diff::SkippedTable;
use chrono::{DateTime, Utc};

/// Lifecycle phase of a clone run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClonePhase {
    Created,
    Preparing,
    Planning,
    StageOne,
    CopyingData,
    Reconciling,
    StageTwo,
    SyncingConfig,
    Truncating,
    Complete,
    Failed,
    Cancelled,
}

impl ClonePhase {
    /// Whether the run has ended in this phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, ClonePhase::Complete | ClonePhase::Failed | ClonePhase::Cancelled)
    }

    /// Rough position in the run, 0..=100.
    pub fn percent(self) -> u8 {
        match self {
            ClonePhase::Created => 0,
            ClonePhase::Preparing => 5,
            ClonePhase::Planning => 10,
            ClonePhase::StageOne => 15,
            ClonePhase::CopyingData => 20,
            ClonePhase::Reconciling => 80,
            ClonePhase::StageTwo => 85,
            ClonePhase::SyncingConfig => 90,
            ClonePhase::Truncating => 95,
            ClonePhase::Complete | ClonePhase::Failed | ClonePhase::Cancelled => 100,
        }
    }
}

impl std::fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClonePhase::Created => write!(f, "Created"),
            ClonePhase::Preparing => write!(f, "Preparing"),
            ClonePhase::Planning => write!(f, "Planning"),
            ClonePhase::StageOne => write!(f, "StageOne"),
            ClonePhase::CopyingData => write!(f, "CopyingData"),
            ClonePhase::Reconciling => write!(f, "Reconciling"),
            ClonePhase::StageTwo => write!(f, "StageTwo"),
            ClonePhase::SyncingConfig => write!(f, "SyncingConfig"),
            ClonePhase::Truncating => write!(f, "Truncating"),
            ClonePhase::Complete => write!(f, "Complete"),
            ClonePhase::Failed => write!(f, "Failed"),
            ClonePhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Snapshot published on the engine's progress channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneProgress {
    pub current_step: ClonePhase,
    pub total_tables: usize,
    pub tables_completed: usize,
    pub rows_copied: usize,
    pub percent_complete: u8,
    pub message: String,
}

impl Default for CloneProgress {
    fn default() -> Self {
        Self {
            current_step: ClonePhase::Created,
            total_tables: 0,
            tables_completed: 0,
            rows_copied: 0,
            percent_complete: 0,
            message: String::new(),
        }
    }
}

impl CloneProgress {
    /// Percentage for the data phase, scaled between its neighbours.
    pub(crate) fn copying_percent(tables_completed: usize, total_tables: usize) -> u8 {
        let start = ClonePhase::CopyingData.percent() as usize;
        let end = ClonePhase::Reconciling.percent() as usize;
        if total_tables == 0 {
            return start as u8;
        }
        let done = tables_completed.min(total_tables);
        (start + (end - start) * done / total_tables) as u8
    }
}

/// Outcome of a finished run.
///
/// Per-table transfer failures are collected here rather than failing the
/// run; rerunning resumes those tables.
#[derive(Debug)]
pub struct CloneReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sha256 of the source model read at the start of the run.
    pub source_digest: String,
    pub tables_copied: usize,
    pub rows_copied: usize,
    pub failures: Vec<(TableName, CloneError)>,
    pub skipped: Vec<SkippedTable>,
    pub pending_foreign_keys: Vec<(TableName, ForeignKey)>,
    pub config_puts: usize,
    pub truncated: bool,
}

impl CloneReport {
    /// No table failed and no foreign key is waiting.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.pending_foreign_keys.is_empty()
    }
}
