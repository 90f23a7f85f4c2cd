//! Two-stage schema migrator.
//!
//! Stage 1 creates schemas and tables without foreign keys, then adds
//! missing columns and keys to existing tables. Stage 2, after the data
//! copy, adds the deferred foreign keys in one bulk call so referential
//! checks run against fully populated tables.

use crate::diff::MigrationPlan;
use crate::error::{CloneError, Result};
use crate::metrics;
use crate::model::{ForeignKey, TableName};
use crate::service::CatalogService;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What stage 2 did.
#[derive(Debug, Clone, Default)]
pub struct StageTwoOutcome {
    /// Foreign keys submitted.
    pub applied: usize,
    /// Foreign keys held back because an endpoint's copy did not finish.
    pub pending: Vec<(TableName, ForeignKey)>,
}

pub struct SchemaMigrator<'a, D: CatalogService> {
    dst: &'a D,
}

impl<'a, D: CatalogService> SchemaMigrator<'a, D> {
    pub fn new(dst: &'a D) -> Self {
        Self { dst }
    }

    /// Create new schema objects, then add columns and keys one at a time.
    ///
    /// Returns the number of structural objects created.
    #[instrument(skip_all, fields(dst = %self.dst.name()))]
    pub async fn stage_one(&self, plan: &MigrationPlan) -> Result<usize> {
        let start = Instant::now();
        let mut created = 0;

        if !plan.new_schema_objects().is_empty() {
            let objects = plan.new_schema_objects().to_vec();
            debug!(count = objects.len(), "Posting schema objects");
            self.dst
                .post_schema_objects(objects)
                .await
                .map_err(|e| CloneError::service("create schemas and tables", e))?;
            created += plan.new_schema_objects().len();
        }

        for (table, column) in plan.new_columns() {
            debug!(table = %table, column = %column.name, "Adding column");
            self.dst
                .post_column(table.clone(), column.clone())
                .await
                .map_err(|e| CloneError::service(format!("add column {table}:{}", column.name), e))?;
            created += 1;
        }

        for (table, key) in plan.new_keys() {
            debug!(table = %table, columns = ?key.unique_columns, "Adding key");
            self.dst
                .post_key(table.clone(), key.clone())
                .await
                .map_err(|e| CloneError::service(format!("add key on {table}"), e))?;
            created += 1;
        }

        metrics::record_stage("one", created, start.elapsed());
        info!(created, elapsed_ms = start.elapsed().as_millis() as u64, "Stage 1 complete");
        Ok(created)
    }

    /// Add deferred foreign keys whose endpoints are both settled.
    ///
    /// A table's foreign keys go on together or not at all: if any of them
    /// has its referring or referenced table in `incomplete`, every key of
    /// that table is held back. A destination table with some foreign keys
    /// counts as migrated on the next run, so a partial set would never be
    /// completed.
    #[instrument(skip_all, fields(dst = %self.dst.name(), incomplete = incomplete.len()))]
    pub async fn stage_two(
        &self,
        plan: &MigrationPlan,
        incomplete: &BTreeSet<TableName>,
    ) -> Result<StageTwoOutcome> {
        let start = Instant::now();
        let mut ready = Vec::new();
        let mut pending = Vec::new();

        for (table, fkeys) in plan.deferred_foreign_keys() {
            let blocked_by = fkeys
                .iter()
                .filter_map(ForeignKey::referenced_table)
                .find(|r| incomplete.contains(r));
            let target = if incomplete.contains(table) || blocked_by.is_some() {
                if let Some(other) = &blocked_by {
                    debug!(table = %table, blocked_by = %other, fkeys = fkeys.len(), "Holding back foreign keys");
                }
                &mut pending
            } else {
                &mut ready
            };
            target.extend(fkeys.iter().map(|fk| (table.clone(), fk.clone())));
        }

        let applied = ready.len();
        if !ready.is_empty() {
            self.dst
                .post_foreign_keys(ready)
                .await
                .map_err(|e| CloneError::service("add foreign keys", e))?;
        }
        if !pending.is_empty() {
            warn!(pending = pending.len(), "Foreign keys held back until their tables finish copying");
        }

        metrics::record_stage("two", applied, start.elapsed());
        info!(applied, pending = pending.len(), "Stage 2 complete");
        Ok(StageTwoOutcome { applied, pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{DiffOptions, ModelDiffer};
    use crate::memory::{MemoryCatalog, ServiceCall};
    use crate::model::CatalogModel;
    use crate::testing::*;

    fn plan_for_empty() -> MigrationPlan {
        ModelDiffer::new(DiffOptions::default())
            .plan(&parent_child_model(), &CatalogModel::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_stage_one_creates_tables_without_fkeys() {
        let dst = MemoryCatalog::new("dst");
        let created = SchemaMigrator::new(&dst).stage_one(&plan_for_empty()).await.unwrap();
        assert_eq!(created, 3);

        let model = dst.model().await;
        let child = model.table(&TableName::new("isa", "child")).unwrap();
        assert!(child.foreign_keys.is_empty());
        assert_eq!(
            dst.calls().iter().filter(|c| matches!(c, ServiceCall::PostSchemaObjects(_))).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stage_one_noop_plan_makes_no_calls() {
        let dst = MemoryCatalog::new("dst");
        let created = SchemaMigrator::new(&dst).stage_one(&MigrationPlan::default()).await.unwrap();
        assert_eq!(created, 0);
        assert!(dst.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stage_two_applies_all_when_complete() {
        let dst = MemoryCatalog::new("dst");
        let plan = plan_for_empty();
        let migrator = SchemaMigrator::new(&dst);
        migrator.stage_one(&plan).await.unwrap();

        let outcome = migrator.stage_two(&plan, &BTreeSet::new()).await.unwrap();
        assert_eq!(outcome.applied, 1);
        assert!(outcome.pending.is_empty());
        let model = dst.model().await;
        assert_eq!(model.table(&TableName::new("isa", "child")).unwrap().foreign_keys.len(), 1);
    }

    #[tokio::test]
    async fn test_stage_two_holds_back_incomplete_endpoints() {
        let dst = MemoryCatalog::new("dst");
        let plan = plan_for_empty();
        let migrator = SchemaMigrator::new(&dst);
        migrator.stage_one(&plan).await.unwrap();

        // referenced side incomplete
        let incomplete: BTreeSet<_> = [TableName::new("isa", "parent")].into();
        let outcome = migrator.stage_two(&plan, &incomplete).await.unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.pending.len(), 1);
        assert!(!dst.calls().iter().any(|c| matches!(c, ServiceCall::PostForeignKeys(_))));
    }

    #[tokio::test]
    async fn test_stage_two_holds_back_every_fkey_of_a_blocked_table() {
        let (child, other) = (TableName::new("isa", "child"), TableName::new("isa", "other"));
        let mut src = parent_child_model();
        add_table(&mut src, simple_table("isa", "other", &[]));
        src.table_mut(&child)
            .unwrap()
            .foreign_keys
            .push(foreign_key(&child, "note", &other, crate::model::RID));

        let dst = MemoryCatalog::new("dst");
        let plan = ModelDiffer::new(DiffOptions::default())
            .plan(&src, &CatalogModel::default())
            .unwrap();
        let migrator = SchemaMigrator::new(&dst);
        migrator.stage_one(&plan).await.unwrap();

        // child -> parent is ready, child -> other is not
        let outcome = migrator.stage_two(&plan, &[other].into()).await.unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.pending.len(), 2);
        assert!(outcome.pending.iter().all(|(t, _)| *t == child));
        assert!(dst.model().await.table(&child).unwrap().foreign_keys.is_empty());
    }
}
