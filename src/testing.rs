//! Model and row fixtures shared by unit tests.

use crate::model::*;
use serde_json::{json, Value};

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

pub fn system_columns() -> Vec<Column> {
    let mut rid = column(RID, "ermrest_rid");
    rid.nullok = false;
    vec![
        rid,
        column(RCT, "ermrest_rct"),
        column(RMT, "ermrest_rmt"),
        column(RCB, "ermrest_rcb"),
        column(RMB, "ermrest_rmb"),
    ]
}

pub fn key(columns: &[&str]) -> Key {
    Key {
        names: vec![],
        unique_columns: columns.iter().map(|c| c.to_string()).collect(),
        config: NodeConfig::default(),
    }
}

/// Table with system columns, a RID key and one text column per name.
pub fn simple_table(schema: &str, table: &str, columns: &[&str]) -> Table {
    let mut column_definitions = system_columns();
    column_definitions.extend(columns.iter().map(|c| column(c, "text")));
    Table {
        schema_name: schema.to_string(),
        table_name: table.to_string(),
        kind: TABLE_KIND.to_string(),
        config: NodeConfig::default(),
        column_definitions,
        keys: vec![key(&[RID])],
        foreign_keys: vec![],
    }
}

pub fn foreign_key(from: &TableName, column: &str, to: &TableName, to_column: &str) -> ForeignKey {
    ForeignKey {
        names: vec![vec![from.schema.clone(), format!("{}_{}_fkey", from.table, column)]],
        foreign_key_columns: vec![ColumnRef {
            schema_name: from.schema.clone(),
            table_name: from.table.clone(),
            column_name: column.to_string(),
        }],
        referenced_columns: vec![ColumnRef {
            schema_name: to.schema.clone(),
            table_name: to.table.clone(),
            column_name: to_column.to_string(),
        }],
        on_update: None,
        on_delete: None,
        config: NodeConfig::default(),
    }
}

pub fn add_table(model: &mut CatalogModel, table: Table) {
    let schema = model
        .schemas
        .entry(table.schema_name.clone())
        .or_insert_with(|| Schema {
            schema_name: table.schema_name.clone(),
            config: NodeConfig::default(),
            tables: Default::default(),
        });
    schema.tables.insert(table.table_name.clone(), table);
}

/// `isa:parent(name)` and `isa:child(parent, note)` with child.parent → parent.RID.
pub fn parent_child_model() -> CatalogModel {
    let parent = TableName::new("isa", "parent");
    let child = TableName::new("isa", "child");
    let mut model = CatalogModel::default();
    model.config.acls.insert("owner".into(), json!(["admin"]));
    add_table(&mut model, simple_table("isa", "parent", &["name"]));
    let mut child_table = simple_table("isa", "child", &["parent", "note"]);
    child_table
        .foreign_keys
        .push(foreign_key(&child, "parent", &parent, RID));
    add_table(&mut model, child_table);
    model
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

pub fn rows(rids: &[&str]) -> Vec<Row> {
    rids.iter().map(|r| row(r, &[])).collect()
}

pub fn rids(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .filter_map(row_id)
        .map(|r| r.0)
        .collect()
}
