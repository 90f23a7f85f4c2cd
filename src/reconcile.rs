//! System-table reconciler.
//!
//! Identity registries (`public:ERMrest_Client`, `public:ERMrest_Group`)
//! may already be referenced by destination rows that the source never had,
//! so they are merged rather than copied: rows only in the destination stay,
//! rows only in the source are created, rows on both sides are updated on
//! their non-identity, non-system columns.
//!
//! The diff is a two-pointer scan over both row sets sorted by the identity
//! key.

use crate::error::{CloneError, Result};
use crate::marker::mark_complete;
use crate::metrics;
use crate::model::{Row, TableName, RCB, RCT, RID, RMB, RMT};
use crate::service::{CatalogService, InsertOptions};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{info, instrument};

/// Identity column of the system tables.
pub const IDENTITY_COLUMN: &str = "ID";

/// Tables merged instead of bulk-copied.
pub fn system_tables() -> [TableName; 2] {
    [
        TableName::new("public", "ERMrest_Client"),
        TableName::new("public", "ERMrest_Group"),
    ]
}

pub fn is_system_table(table: &TableName) -> bool {
    system_tables().contains(table)
}

/// Output of the merge diff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Source rows with no destination counterpart.
    pub create: Vec<Row>,
    /// Source rows whose identity exists in the destination.
    pub update: Vec<Row>,
    /// Destination rows with no source counterpart; never touched.
    pub retained: usize,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.update.is_empty()
    }
}

fn identity_of<'a>(row: &'a Row, key: &str) -> Option<&'a Value> {
    row.get(key).filter(|v| !v.is_null())
}

/// Strings and numbers compare naturally, mixed values by their JSON text.
fn compare_identity(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn sorted_by_identity(rows: Vec<Row>, key: &str) -> Vec<(Value, Row)> {
    let mut keyed: Vec<(Value, Row)> = rows
        .into_iter()
        .filter_map(|r| identity_of(&r, key).cloned().map(|k| (k, r)))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| compare_identity(a, b));
    keyed
}

/// Merge-diff `want` (source) against `have` (destination) on `key`.
pub fn reconcile(want: Vec<Row>, have: Vec<Row>, key: &str) -> ReconcilePlan {
    let want = sorted_by_identity(want, key);
    let have = sorted_by_identity(have, key);
    let mut plan = ReconcilePlan::default();

    let (mut i, mut j) = (0, 0);
    while i < want.len() && j < have.len() {
        match compare_identity(&want[i].0, &have[j].0) {
            Ordering::Less => {
                plan.create.push(want[i].1.clone());
                i += 1;
            }
            Ordering::Greater => {
                plan.retained += 1;
                j += 1;
            }
            Ordering::Equal => {
                plan.update.push(want[i].1.clone());
                i += 1;
                j += 1;
            }
        }
    }
    plan.create.extend(want[i..].iter().map(|(_, r)| r.clone()));
    plan.retained += have.len() - j;
    plan
}

/// Columns updated on matched rows: every source column except identity
/// and system-maintained ones.
pub fn update_targets(rows: &[Row], key: &str) -> Vec<String> {
    let excluded = [RID, RMT, RMB, key];
    let columns: BTreeSet<&String> = rows.iter().flat_map(|r| r.keys()).collect();
    columns
        .into_iter()
        .filter(|c| !excluded.contains(&c.as_str()))
        .cloned()
        .collect()
}

/// Counts of one table reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub retained: usize,
}

/// Merge one system table from `src` into `dst`, then mark it complete.
#[instrument(skip(src, dst), fields(table = %table))]
pub async fn reconcile_table<S, D>(src: &S, dst: &D, table: &TableName) -> Result<ReconcileOutcome>
where
    S: CatalogService + ?Sized,
    D: CatalogService + ?Sized,
{
    let want = src
        .fetch_all(table.clone())
        .await
        .map_err(|e| CloneError::transfer(table.to_string(), format!("source read failed: {e}")))?;
    let have = dst
        .fetch_all(table.clone())
        .await
        .map_err(|e| CloneError::transfer(table.to_string(), format!("destination read failed: {e}")))?;

    let plan = reconcile(want, have, IDENTITY_COLUMN);
    let mut outcome = ReconcileOutcome {
        retained: plan.retained,
        ..Default::default()
    };

    if !plan.create.is_empty() {
        outcome.created = dst
            .insert_rows(
                table.clone(),
                plan.create,
                InsertOptions::preserving(&[RCT, RCB]).skip_conflicts(),
            )
            .await
            .map_err(|e| CloneError::transfer(table.to_string(), format!("create failed: {e}")))?;
    }
    if !plan.update.is_empty() {
        let targets = update_targets(&plan.update, IDENTITY_COLUMN);
        outcome.updated = dst
            .update_rows(table.clone(), vec![IDENTITY_COLUMN.to_string()], targets, plan.update)
            .await
            .map_err(|e| CloneError::transfer(table.to_string(), format!("update failed: {e}")))?;
    }

    mark_complete(dst, table).await?;
    metrics::record_reconcile(&table.to_string(), outcome.created, outcome.updated, outcome.retained);
    info!(
        created = outcome.created,
        updated = outcome.updated,
        retained = outcome.retained,
        "System table reconciled"
    );
    Ok(outcome)
}
