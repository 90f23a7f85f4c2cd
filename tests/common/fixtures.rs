//! Catalog model and row fixtures.

use catalog_replication::model::*;
use catalog_replication::MemoryCatalog;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn parent() -> TableName {
    TableName::new("isa", "parent")
}

pub fn child() -> TableName {
    TableName::new("isa", "child")
}

pub fn clients() -> TableName {
    TableName::new("public", "ERMrest_Client")
}

pub fn column(name: &str, typename: &str) -> Column {
    Column {
        name: name.to_string(),
        column_type: ColumnType {
            typename: typename.to_string(),
        },
        nullok: true,
        default: None,
        config: NodeConfig::default(),
    }
}

pub fn key(columns: &[&str]) -> Key {
    Key {
        names: vec![],
        unique_columns: columns.iter().map(|c| c.to_string()).collect(),
        config: NodeConfig::default(),
    }
}

/// Table with the five system columns, a RID key and text columns.
pub fn table(name: &TableName, columns: &[&str]) -> Table {
    let mut rid = column(RID, "ermrest_rid");
    rid.nullok = false;
    let mut column_definitions = vec![
        rid,
        column(RCT, "ermrest_rct"),
        column(RMT, "ermrest_rmt"),
        column(RCB, "ermrest_rcb"),
        column(RMB, "ermrest_rmb"),
    ];
    column_definitions.extend(columns.iter().map(|c| column(c, "text")));
    Table {
        schema_name: name.schema.clone(),
        table_name: name.table.clone(),
        kind: TABLE_KIND.to_string(),
        config: NodeConfig::default(),
        column_definitions,
        keys: vec![key(&[RID])],
        foreign_keys: vec![],
    }
}

pub fn foreign_key(from: &TableName, column: &str, to: &TableName) -> ForeignKey {
    let col = |t: &TableName, c: &str| ColumnRef {
        schema_name: t.schema.clone(),
        table_name: t.table.clone(),
        column_name: c.to_string(),
    };
    ForeignKey {
        names: vec![vec![from.schema.clone(), format!("{}_{column}_fkey", from.table)]],
        foreign_key_columns: vec![col(from, column)],
        referenced_columns: vec![col(to, RID)],
        on_update: None,
        on_delete: None,
        config: NodeConfig::default(),
    }
}

pub fn add_table(model: &mut CatalogModel, table: Table) {
    model
        .schemas
        .entry(table.schema_name.clone())
        .or_insert_with(|| Schema {
            schema_name: table.schema_name.clone(),
            config: NodeConfig::default(),
            tables: Default::default(),
        })
        .tables
        .insert(table.table_name.clone(), table);
}

/// Owned catalog with `isa:parent(name)` and `isa:child(parent, note)`,
/// child.parent referencing parent.RID.
pub fn parent_child_model() -> CatalogModel {
    let mut model = CatalogModel::default();
    model.config.acls.insert("owner".into(), json!(["admin"]));
    model.config.acls.insert("enumerate".into(), json!(["*"]));
    add_table(&mut model, table(&parent(), &["name"]));
    let mut c = table(&child(), &["parent", "note"]);
    c.foreign_keys.push(foreign_key(&child(), "parent", &parent()));
    add_table(&mut model, c);
    model
}

/// `public:ERMrest_Client` keyed on `ID`.
pub fn client_table() -> Table {
    let mut t = table(&clients(), &["ID", "Full_Name"]);
    t.keys.push(key(&["ID"]));
    t
}

pub fn row(rid: &str, fields: &[(&str, Value)]) -> Row {
    let mut row = Row::new();
    row.insert(RID.to_string(), json!(rid));
    row.insert(RCT.to_string(), json!("2024-01-01T00:00:00Z"));
    row.insert(RCB.to_string(), json!("creator"));
    for (k, v) in fields {
        row.insert(k.to_string(), v.clone());
    }
    row
}

/// Zero-padded RIDs so string order equals numeric order.
pub fn rid(n: usize) -> String {
    format!("{n:04}")
}

pub fn numbered_rows(range: std::ops::RangeInclusive<usize>) -> Vec<Row> {
    range.map(|n| row(&rid(n), &[("name", json!(format!("row {n}")))])).collect()
}

pub fn rids(rows: &[Row]) -> Vec<String> {
    rows.iter().filter_map(row_id).map(|r| r.0).collect()
}

/// Source with parents `0001..=parents` and one child per parent.
pub fn seeded_source(parents: usize) -> Arc<MemoryCatalog> {
    let src = Arc::new(MemoryCatalog::with_model("src", parent_child_model()));
    src.seed_rows(&parent(), numbered_rows(1..=parents));
    src.seed_rows(
        &child(),
        (1..=parents)
            .map(|n| row(&rid(1000 + n), &[("parent", json!(rid(n))), ("note", json!("x"))]))
            .collect(),
    );
    src
}
