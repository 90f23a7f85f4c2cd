//! Model differ.
//!
//! Compares the source and destination models and produces an immutable
//! [`MigrationPlan`]. The destination may be empty, a strict subset of the
//! source, or equal to it; any structure present only in the destination
//! means the two catalogs have divergent history and is always fatal.
//!
//! # Classification
//!
//! ```text
//! source table ──┬─ kind != "table"        → skipped (warning)
//!                ├─ no RID column          → Configuration error
//!                ├─ absent in destination  → Create: core definition in
//!                │                           new_schema_objects, FKs deferred,
//!                │                           marker = Started if copying data
//!                └─ present in destination
//!                     ├─ extra dst column/key     → Configuration error
//!                     ├─ column type/null/default → Configuration error
//!                     ├─ dst already has FKs      → skipped (already migrated)
//!                     └─ otherwise                → Extend: new columns/keys
//!                                                   queued, FKs deferred,
//!                                                   marker read from dst
//! ```

use crate::config::CloneConfig;
use crate::error::{CloneError, Result};
use crate::marker::{ProgressMarker, CLONE_STATE_TAG};
use crate::model::{
    CatalogModel, Column, ForeignKey, Key, NodeRef, Schema, SchemaObject, Table, TableName, RID,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Tables whose RID may not be the target of a cloned foreign key.
const UNCLONEABLE_FK_TARGETS: [(&str, &str); 2] = [("public", "ERMrest_Client"), ("public", "ERMrest_Group")];

/// Inputs of the differ that come from the clone configuration.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub copy_data: bool,
    pub copy_annotations: bool,
    pub copy_policy: bool,
    pub exclude_schemas: BTreeSet<String>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self::from(&CloneConfig::default())
    }
}

impl From<&CloneConfig> for DiffOptions {
    fn from(config: &CloneConfig) -> Self {
        Self {
            copy_data: config.copy_data,
            copy_annotations: config.copy_annotations,
            copy_policy: config.copy_policy,
            exclude_schemas: config.exclude_schemas.iter().cloned().collect(),
        }
    }
}

/// What happens to a source table's structure in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableAction {
    /// Created in stage 1.
    Create,
    /// Exists; missing columns/keys are added.
    Extend,
}

/// Per-table entry of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub name: TableName,
    pub action: TableAction,
    pub marker: ProgressMarker,
}

/// Why a source table takes no part in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Views and other non-table kinds carry no copyable rows.
    NotATable { kind: String },
    /// Destination already has foreign keys on this table.
    AlreadyMigrated,
    /// Not connected to the requested root table.
    OutsideSubset,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotATable { kind } => write!(f, "kind {kind} is not copyable"),
            SkipReason::AlreadyMigrated => write!(f, "already migrated"),
            SkipReason::OutsideSubset => write!(f, "outside requested subset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTable {
    pub name: TableName,
    pub reason: SkipReason,
}

/// Immutable result of diffing two models.
///
/// Built once per run and consumed by the schema migrator and copiers.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    new_schema_objects: Vec<SchemaObject>,
    new_columns: Vec<(TableName, Column)>,
    new_keys: Vec<(TableName, Key)>,
    deferred_foreign_keys: Vec<(TableName, Vec<ForeignKey>)>,
    tables: Vec<TablePlan>,
    skipped: Vec<SkippedTable>,
}

impl MigrationPlan {
    /// Schemas (without tables) and tables (without foreign keys) to create.
    pub fn new_schema_objects(&self) -> &[SchemaObject] {
        &self.new_schema_objects
    }

    /// Columns to add to existing tables, one call each.
    pub fn new_columns(&self) -> &[(TableName, Column)] {
        &self.new_columns
    }

    /// Keys to add to existing tables, one call each.
    pub fn new_keys(&self) -> &[(TableName, Key)] {
        &self.new_keys
    }

    /// Foreign keys per referring table, applied in stage 2.
    pub fn deferred_foreign_keys(&self) -> &[(TableName, Vec<ForeignKey>)] {
        &self.deferred_foreign_keys
    }

    pub fn tables(&self) -> &[TablePlan] {
        &self.tables
    }

    pub fn skipped(&self) -> &[SkippedTable] {
        &self.skipped
    }

    pub fn table(&self, name: &TableName) -> Option<&TablePlan> {
        self.tables.iter().find(|t| &t.name == name)
    }

    /// Tables whose marker says rows still need copying.
    pub fn tables_to_copy(&self) -> Vec<TableName> {
        self.tables
            .iter()
            .filter(|t| t.marker.needs_copy())
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn deferred_foreign_key_count(&self) -> usize {
        self.deferred_foreign_keys.iter().map(|(_, fks)| fks.len()).sum()
    }

    /// Nothing to create in stage 1.
    pub fn stage_one_is_empty(&self) -> bool {
        self.new_schema_objects.is_empty() && self.new_columns.is_empty() && self.new_keys.is_empty()
    }
}

/// Accumulates plan parts while walking the source model.
#[derive(Default)]
struct PlanBuilder {
    plan: MigrationPlan,
}

impl PlanBuilder {
    fn build(self) -> MigrationPlan {
        self.plan
    }
}

/// Computes migration plans.
#[derive(Debug, Clone, Default)]
pub struct ModelDiffer {
    options: DiffOptions,
}

impl ModelDiffer {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    /// Diff `src` against `dst`.
    pub fn plan(&self, src: &CatalogModel, dst: &CatalogModel) -> Result<MigrationPlan> {
        src.validate()?;
        let mut builder = PlanBuilder::default();

        for (sname, schema) in &src.schemas {
            if self.options.exclude_schemas.contains(sname) {
                debug!(schema = %sname, "Schema excluded");
                continue;
            }
            let dst_schema = dst.schema(sname);
            if dst_schema.is_none() {
                builder
                    .plan
                    .new_schema_objects
                    .push(SchemaObject::Schema(self.schema_core(schema)));
            }

            for table in schema.tables.values() {
                let name = table.name();
                if !table.is_table_kind() {
                    warn!(table = %name, kind = %table.kind, "Skipping non-table relation");
                    builder.plan.skipped.push(SkippedTable {
                        name,
                        reason: SkipReason::NotATable {
                            kind: table.kind.clone(),
                        },
                    });
                    continue;
                }
                if !table.has_identity() {
                    return Err(CloneError::configuration(
                        name.to_string(),
                        "source table lacks system columns and cannot be cloned",
                    ));
                }

                let fkeys = self.deferred_fkeys(table)?;
                match dst.table(&name) {
                    None => {
                        let marker = ProgressMarker::initial(self.options.copy_data);
                        builder
                            .plan
                            .new_schema_objects
                            .push(SchemaObject::Table(self.table_core(table, marker)));
                        builder.plan.tables.push(TablePlan {
                            name: name.clone(),
                            action: TableAction::Create,
                            marker,
                        });
                        builder.plan.deferred_foreign_keys.push((name, fkeys));
                    }
                    Some(existing) => {
                        let (columns, keys) = self.structural_delta(table, existing)?;
                        if !existing.foreign_keys.is_empty() {
                            info!(table = %name, "Destination already has foreign keys, treating as migrated");
                            builder.plan.skipped.push(SkippedTable {
                                name,
                                reason: SkipReason::AlreadyMigrated,
                            });
                            continue;
                        }
                        let marker = ProgressMarker::from_annotation(
                            &name,
                            existing.config.annotations.get(CLONE_STATE_TAG),
                        )?;
                        builder.plan.new_columns.extend(columns.into_iter().map(|c| (name.clone(), c)));
                        builder.plan.new_keys.extend(keys.into_iter().map(|k| (name.clone(), k)));
                        builder.plan.tables.push(TablePlan {
                            name: name.clone(),
                            action: TableAction::Extend,
                            marker,
                        });
                        builder.plan.deferred_foreign_keys.push((name, fkeys));
                    }
                }
            }
        }

        let plan = builder.build();
        info!(
            schema_objects = plan.new_schema_objects.len(),
            new_columns = plan.new_columns.len(),
            new_keys = plan.new_keys.len(),
            deferred_fkeys = plan.deferred_foreign_key_count(),
            tables = plan.tables.len(),
            skipped = plan.skipped.len(),
            "Migration plan computed"
        );
        Ok(plan)
    }

    /// Columns and keys missing from `dst`, after checking compatibility.
    fn structural_delta(&self, src: &Table, dst: &Table) -> Result<(Vec<Column>, Vec<Key>)> {
        let name = src.name();
        let mut new_columns = Vec::new();
        for column in &src.column_definitions {
            match dst.column(&column.name) {
                None => new_columns.push(self.pruned_column(column)),
                Some(existing) => check_column_compatibility(&name, column, existing)?,
            }
        }
        for column in &dst.column_definitions {
            if src.column(&column.name).is_none() {
                return Err(CloneError::configuration(
                    format!("{name}:{}", column.name),
                    "destination column does not exist in source catalog",
                ));
            }
        }

        let src_keys: BTreeMap<Vec<String>, &Key> = src.keys.iter().map(|k| (k.identity(), k)).collect();
        let dst_keys: BTreeSet<Vec<String>> = dst.keys.iter().map(Key::identity).collect();
        let new_keys = src_keys
            .iter()
            .filter(|(identity, _)| !dst_keys.contains(*identity))
            .map(|(_, key)| self.pruned_key(key))
            .collect();
        if let Some(extra) = dst_keys.iter().find(|k| !src_keys.contains_key(*k)) {
            return Err(CloneError::configuration(
                format!("{name}({})", extra.join(", ")),
                "destination key does not exist in source catalog",
            ));
        }
        Ok((new_columns, new_keys))
    }

    fn deferred_fkeys(&self, table: &Table) -> Result<Vec<ForeignKey>> {
        table
            .foreign_keys
            .iter()
            .map(|fk| {
                let node = NodeRef::ForeignKey(table, fk).path().to_string();
                for col in &fk.referenced_columns {
                    let forbidden = UNCLONEABLE_FK_TARGETS
                        .iter()
                        .any(|(s, t)| col.schema_name == *s && col.table_name == *t && col.column_name == RID);
                    if forbidden {
                        return Err(CloneError::configuration(
                            node,
                            format!(
                                "cannot clone foreign key reference to {}:{}:{}",
                                col.schema_name, col.table_name, col.column_name
                            ),
                        ));
                    }
                    if self.options.exclude_schemas.contains(&col.schema_name) {
                        return Err(CloneError::configuration(
                            node,
                            format!("references excluded schema {}", col.schema_name),
                        ));
                    }
                }
                let mut fk = fk.clone();
                fk.config.prune(self.options.copy_annotations, self.options.copy_policy);
                Ok(fk)
            })
            .collect()
    }

    fn schema_core(&self, schema: &Schema) -> Schema {
        let mut def = schema.without_tables();
        def.config.prune(self.options.copy_annotations, self.options.copy_policy);
        def
    }

    fn table_core(&self, table: &Table, marker: ProgressMarker) -> Table {
        let mut def = table.without_foreign_keys();
        def.config.prune(self.options.copy_annotations, self.options.copy_policy);
        def.config
            .annotations
            .insert(CLONE_STATE_TAG.to_string(), marker.to_annotation());
        def.column_definitions = table.column_definitions.iter().map(|c| self.pruned_column(c)).collect();
        def.keys = table.keys.iter().map(|k| self.pruned_key(k)).collect();
        def
    }

    fn pruned_column(&self, column: &Column) -> Column {
        let mut c = column.clone();
        c.config.prune(self.options.copy_annotations, self.options.copy_policy);
        c
    }

    fn pruned_key(&self, key: &Key) -> Key {
        let mut k = key.clone();
        k.config.prune(self.options.copy_annotations, self.options.copy_policy);
        k
    }
}

fn check_column_compatibility(table: &TableName, src: &Column, dst: &Column) -> Result<()> {
    let mismatch = |field: &str, sv: String, dv: String| {
        CloneError::configuration(
            format!("{table}:{}", src.name),
            format!("source/dest column {field} mismatch {sv} != {dv}"),
        )
    };
    if src.column_type.typename != dst.column_type.typename {
        return Err(mismatch(
            "type",
            src.column_type.typename.clone(),
            dst.column_type.typename.clone(),
        ));
    }
    if src.nullok != dst.nullok {
        return Err(mismatch("nullok", src.nullok.to_string(), dst.nullok.to_string()));
    }
    if src.default != dst.default {
        return Err(mismatch("default", format!("{:?}", src.default), format!("{:?}", dst.default)));
    }
    Ok(())
}
