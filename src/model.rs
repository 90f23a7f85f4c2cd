//! Catalog model graph.
//!
//! A catalog is a forest of schema → table → {column, key, foreign key}
//! nodes. Each node carries its structural definition plus a bag of
//! configuration ([`NodeConfig`]): comment, annotations, ACLs and ACL
//! bindings.
//!
//! The serde layout mirrors the catalog service's model document, so a
//! model can be read from the service verbatim and definitions can be sent
//! back in stage-1/stage-2 schema calls.
//!
//! # Node Addressing
//!
//! ```text
//! NodePath::Catalog                          catalog
//! NodePath::Schema     { schema }            isa
//! NodePath::Table      (TableName)           isa:dataset
//! NodePath::Column     { table, column }     isa:dataset:title
//! NodePath::Key        { table, columns }    isa:dataset(key: RID)
//! NodePath::ForeignKey { table, key }       isa:dataset(fkey: owner -> isa:person(RID))
//! ```
//!
//! Keys are identified by their sorted unique-column names, foreign keys by
//! their sorted referring columns, the referenced table and the referenced
//! columns.

use crate::error::{CloneError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Row identifier column.
pub const RID: &str = "RID";
/// Row creation time column.
pub const RCT: &str = "RCT";
/// Row creator column.
pub const RCB: &str = "RCB";
/// Row modification time column.
pub const RMT: &str = "RMT";
/// Row modifier column.
pub const RMB: &str = "RMB";

/// The only table kind whose rows are copied.
pub const TABLE_KIND: &str = "table";

/// Annotation map (tag URI → arbitrary JSON).
pub type Annotations = BTreeMap<String, Value>;

/// ACL map (access mode → member list, or null).
pub type Acls = BTreeMap<String, Value>;

/// Dynamic ACL bindings keyed by purpose.
pub type AclBindings = BTreeMap<String, Value>;

/// A row as exchanged with the catalog service.
pub type Row = serde_json::Map<String, Value>;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Qualified table name, displayed as `schema:table`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `schema:table`.
    pub fn parse(text: &str) -> Result<Self> {
        match text.split_once(':') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(schema, table))
            }
            _ => Err(CloneError::configuration(
                text,
                "table name must look like schema:table",
            )),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.schema, self.table)
    }
}

/// Stable row identifier (the `RID` column value).
///
/// Identifiers are assigned once by the source service and preserved by
/// every copy, so "everything after the largest RID I already have" is a
/// correct resume point.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the `RID` of a row, if it has a string one.
pub fn row_id(row: &Row) -> Option<RowId> {
    row.get(RID).and_then(Value::as_str).map(RowId::new)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Node configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration bag carried by every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: Annotations,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub acls: Acls,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub acl_bindings: AclBindings,
}

impl NodeConfig {
    /// The JSON value of one configuration field.
    pub fn field_value(&self, field: ConfigField) -> Value {
        fn map(m: &BTreeMap<String, Value>) -> Value {
            Value::Object(m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
        match field {
            ConfigField::Comment => self
                .comment
                .as_ref()
                .map(|c| Value::String(c.clone()))
                .unwrap_or(Value::Null),
            ConfigField::Annotations => map(&self.annotations),
            ConfigField::Acls => map(&self.acls),
            ConfigField::AclBindings => map(&self.acl_bindings),
        }
    }

    /// Replace one configuration field from its JSON value.
    pub fn set_field(&mut self, field: ConfigField, value: Value) -> std::result::Result<(), String> {
        fn map(value: Value) -> std::result::Result<BTreeMap<String, Value>, String> {
            match value {
                Value::Null => Ok(BTreeMap::new()),
                Value::Object(m) => Ok(m.into_iter().collect()),
                other => Err(format!("expected object, got {other}")),
            }
        }
        match field {
            ConfigField::Comment => {
                self.comment = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s),
                    other => return Err(format!("expected string comment, got {other}")),
                }
            }
            ConfigField::Annotations => self.annotations = map(value)?,
            ConfigField::Acls => self.acls = map(value)?,
            ConfigField::AclBindings => self.acl_bindings = map(value)?,
        }
        Ok(())
    }

    /// Drop the parts a clone is not asked to copy. Comments always survive.
    pub fn prune(&mut self, keep_annotations: bool, keep_policy: bool) {
        if !keep_annotations {
            self.annotations.clear();
        }
        if !keep_policy {
            self.acls.clear();
            self.acl_bindings.clear();
        }
    }
}

/// One replaceable part of a node's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigField {
    Comment,
    Annotations,
    Acls,
    AclBindings,
}

impl ConfigField {
    pub const ALL: [ConfigField; 4] = [
        ConfigField::Comment,
        ConfigField::Annotations,
        ConfigField::Acls,
        ConfigField::AclBindings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigField::Comment => "comment",
            ConfigField::Annotations => "annotation",
            ConfigField::Acls => "acl",
            ConfigField::AclBindings => "acl_binding",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of node kinds in a catalog graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Catalog,
    Schema,
    Table,
    Column,
    Key,
    ForeignKey,
}

impl NodeKind {
    /// Whether nodes of this kind carry the given configuration field.
    pub fn supports(&self, field: ConfigField) -> bool {
        match (self, field) {
            (NodeKind::Catalog, ConfigField::Annotations | ConfigField::Acls) => true,
            (NodeKind::Catalog, _) => false,
            (NodeKind::Schema, ConfigField::AclBindings) => false,
            (NodeKind::Key, ConfigField::Acls | ConfigField::AclBindings) => false,
            _ => true,
        }
    }
}

/// Capability shared by every node: it has a configuration bag.
pub trait Configurable {
    fn kind(&self) -> NodeKind;
    fn config(&self) -> &NodeConfig;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Structural definitions
// ═══════════════════════════════════════════════════════════════════════════════

/// The whole catalog model document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogModel {
    #[serde(flatten)]
    pub config: NodeConfig,
    #[serde(default)]
    pub schemas: BTreeMap<String, Schema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub schema_name: String,
    #[serde(flatten)]
    pub config: NodeConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tables: BTreeMap<String, Table>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub schema_name: String,
    pub table_name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(flatten)]
    pub config: NodeConfig,
    #[serde(default)]
    pub column_definitions: Vec<Column>,
    #[serde(default)]
    pub keys: Vec<Key>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

fn default_kind() -> String {
    TABLE_KIND.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullok")]
    pub nullok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(flatten)]
    pub config: NodeConfig,
}

fn default_nullok() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnType {
    pub typename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<Vec<String>>,
    pub unique_columns: Vec<String>,
    #[serde(flatten)]
    pub config: NodeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<Vec<String>>,
    pub foreign_key_columns: Vec<ColumnRef>,
    pub referenced_columns: Vec<ColumnRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
    #[serde(flatten)]
    pub config: NodeConfig,
}

impl Table {
    pub fn name(&self) -> TableName {
        TableName::new(&self.schema_name, &self.table_name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_definitions.iter().find(|c| c.name == name)
    }

    pub fn is_table_kind(&self) -> bool {
        self.kind == TABLE_KIND
    }

    /// Whether the table has the stable row-identifier column.
    pub fn has_identity(&self) -> bool {
        self.column(RID).is_some()
    }

    pub fn key(&self, identity: &[String]) -> Option<&Key> {
        self.keys.iter().find(|k| k.identity() == identity)
    }

    pub fn foreign_key(&self, identity: &ForeignKeyIdentity) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| &fk.identity() == identity)
    }

    /// Copy of this definition without foreign keys (stage-1 shape).
    pub fn without_foreign_keys(&self) -> Table {
        Table {
            foreign_keys: Vec::new(),
            ..self.clone()
        }
    }
}

impl Key {
    /// Sorted unique-column names.
    pub fn identity(&self) -> Vec<String> {
        let mut cols = self.unique_columns.clone();
        cols.sort();
        cols
    }
}

impl ForeignKey {
    /// The table named by the referenced columns.
    pub fn referenced_table(&self) -> Option<TableName> {
        self.referenced_columns
            .first()
            .map(|c| TableName::new(&c.schema_name, &c.table_name))
    }

    /// Sorted referring columns, the referenced table, and the referenced
    /// columns paired in the same order.
    pub fn identity(&self) -> ForeignKeyIdentity {
        let mut pairs: Vec<(&str, &str)> = self
            .foreign_key_columns
            .iter()
            .zip(&self.referenced_columns)
            .map(|(from, to)| (from.column_name.as_str(), to.column_name.as_str()))
            .collect();
        pairs.sort();
        ForeignKeyIdentity {
            columns: pairs.iter().map(|(from, _)| from.to_string()).collect(),
            referenced: self.referenced_table(),
            referenced_columns: pairs.iter().map(|(_, to)| to.to_string()).collect(),
        }
    }
}

/// What tells two foreign keys of one table apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKeyIdentity {
    pub columns: Vec<String>,
    pub referenced: Option<TableName>,
    pub referenced_columns: Vec<String>,
}

impl Schema {
    /// Copy of this definition without its tables (stage-1 shape).
    pub fn without_tables(&self) -> Schema {
        Schema {
            schema_name: self.schema_name.clone(),
            config: self.config.clone(),
            tables: BTreeMap::new(),
        }
    }
}

/// One entry of a bulk schema-creation call.
///
/// Tables are listed before schemas so untagged decoding picks the more
/// specific shape first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaObject {
    Table(Table),
    Schema(Schema),
}

impl SchemaObject {
    pub fn describe(&self) -> String {
        match self {
            SchemaObject::Table(t) => t.name().to_string(),
            SchemaObject::Schema(s) => s.schema_name.clone(),
        }
    }
}

macro_rules! configurable {
    ($ty:ty, $kind:expr) => {
        impl Configurable for $ty {
            fn kind(&self) -> NodeKind {
                $kind
            }
            fn config(&self) -> &NodeConfig {
                &self.config
            }
        }
    };
}

configurable!(CatalogModel, NodeKind::Catalog);
configurable!(Schema, NodeKind::Schema);
configurable!(Table, NodeKind::Table);
configurable!(Column, NodeKind::Column);
configurable!(Key, NodeKind::Key);
configurable!(ForeignKey, NodeKind::ForeignKey);

// ═══════════════════════════════════════════════════════════════════════════════
// Node references
// ═══════════════════════════════════════════════════════════════════════════════

/// Owned address of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodePath {
    Catalog,
    Schema {
        schema: String,
    },
    Table(TableName),
    Column {
        table: TableName,
        column: String,
    },
    Key {
        table: TableName,
        columns: Vec<String>,
    },
    ForeignKey {
        table: TableName,
        key: ForeignKeyIdentity,
    },
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePath::Catalog => write!(f, "catalog"),
            NodePath::Schema { schema } => write!(f, "{schema}"),
            NodePath::Table(t) => write!(f, "{t}"),
            NodePath::Column { table, column } => write!(f, "{table}:{column}"),
            NodePath::Key { table, columns } => write!(f, "{table}(key: {})", columns.join(",")),
            NodePath::ForeignKey { table, key } => match &key.referenced {
                Some(r) => write!(
                    f,
                    "{table}(fkey: {} -> {r}({}))",
                    key.columns.join(","),
                    key.referenced_columns.join(",")
                ),
                None => write!(f, "{table}(fkey: {})", key.columns.join(",")),
            },
        }
    }
}

/// Borrowed view of any node, tagged by kind.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Catalog(&'a CatalogModel),
    Schema(&'a Schema),
    Table(&'a Table),
    Column(&'a Table, &'a Column),
    Key(&'a Table, &'a Key),
    ForeignKey(&'a Table, &'a ForeignKey),
}

impl NodeRef<'_> {
    pub fn path(&self) -> NodePath {
        match self {
            NodeRef::Catalog(_) => NodePath::Catalog,
            NodeRef::Schema(s) => NodePath::Schema {
                schema: s.schema_name.clone(),
            },
            NodeRef::Table(t) => NodePath::Table(t.name()),
            NodeRef::Column(t, c) => NodePath::Column {
                table: t.name(),
                column: c.name.clone(),
            },
            NodeRef::Key(t, k) => NodePath::Key {
                table: t.name(),
                columns: k.identity(),
            },
            NodeRef::ForeignKey(t, fk) => NodePath::ForeignKey {
                table: t.name(),
                key: fk.identity(),
            },
        }
    }
}

impl Configurable for NodeRef<'_> {
    fn kind(&self) -> NodeKind {
        match self {
            NodeRef::Catalog(n) => n.kind(),
            NodeRef::Schema(n) => n.kind(),
            NodeRef::Table(n) => n.kind(),
            NodeRef::Column(_, n) => n.kind(),
            NodeRef::Key(_, n) => n.kind(),
            NodeRef::ForeignKey(_, n) => n.kind(),
        }
    }

    fn config(&self) -> &NodeConfig {
        match self {
            NodeRef::Catalog(n) => n.config(),
            NodeRef::Schema(n) => n.config(),
            NodeRef::Table(n) => n.config(),
            NodeRef::Column(_, n) => n.config(),
            NodeRef::Key(_, n) => n.config(),
            NodeRef::ForeignKey(_, n) => n.config(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Whole-model queries
// ═══════════════════════════════════════════════════════════════════════════════

impl CatalogModel {
    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn table(&self, name: &TableName) -> Option<&Table> {
        self.schemas
            .get(&name.schema)
            .and_then(|s| s.tables.get(&name.table))
    }

    pub fn table_mut(&mut self, name: &TableName) -> Option<&mut Table> {
        self.schemas
            .get_mut(&name.schema)
            .and_then(|s| s.tables.get_mut(&name.table))
    }

    /// All tables in schema/table name order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.schemas.values().flat_map(|s| s.tables.values())
    }

    /// Every node, parents before children, in name order.
    pub fn nodes(&self) -> Vec<NodeRef<'_>> {
        let mut nodes = vec![NodeRef::Catalog(self)];
        for schema in self.schemas.values() {
            nodes.push(NodeRef::Schema(schema));
            for table in schema.tables.values() {
                nodes.push(NodeRef::Table(table));
                nodes.extend(table.column_definitions.iter().map(|c| NodeRef::Column(table, c)));
                nodes.extend(table.keys.iter().map(|k| NodeRef::Key(table, k)));
                nodes.extend(table.foreign_keys.iter().map(|fk| NodeRef::ForeignKey(table, fk)));
            }
        }
        nodes
    }

    /// Look up a node by path.
    pub fn node(&self, path: &NodePath) -> Option<NodeRef<'_>> {
        match path {
            NodePath::Catalog => Some(NodeRef::Catalog(self)),
            NodePath::Schema { schema } => self.schema(schema).map(NodeRef::Schema),
            NodePath::Table(t) => self.table(t).map(NodeRef::Table),
            NodePath::Column { table, column } => {
                let t = self.table(table)?;
                t.column(column).map(|c| NodeRef::Column(t, c))
            }
            NodePath::Key { table, columns } => {
                let t = self.table(table)?;
                t.key(columns).map(|k| NodeRef::Key(t, k))
            }
            NodePath::ForeignKey { table, key } => {
                let t = self.table(table)?;
                t.foreign_key(key).map(|fk| NodeRef::ForeignKey(t, fk))
            }
        }
    }

    /// Mutable configuration of the node at `path`.
    pub fn config_mut(&mut self, path: &NodePath) -> Option<&mut NodeConfig> {
        match path {
            NodePath::Catalog => Some(&mut self.config),
            NodePath::Schema { schema } => self.schemas.get_mut(schema).map(|s| &mut s.config),
            NodePath::Table(t) => self.table_mut(t).map(|t| &mut t.config),
            NodePath::Column { table, column } => self
                .table_mut(table)?
                .column_definitions
                .iter_mut()
                .find(|c| &c.name == column)
                .map(|c| &mut c.config),
            NodePath::Key { table, columns } => self
                .table_mut(table)?
                .keys
                .iter_mut()
                .find(|k| &k.identity() == columns)
                .map(|k| &mut k.config),
            NodePath::ForeignKey { table, key } => self
                .table_mut(table)?
                .foreign_keys
                .iter_mut()
                .find(|fk| &fk.identity() == key)
                .map(|fk| &mut fk.config),
        }
    }

    /// Check that every foreign key references an existing key.
    ///
    /// The referenced-column set must equal the unique-column set of some
    /// key (possibly compound) in the target table.
    pub fn validate(&self) -> Result<()> {
        for table in self.tables() {
            for fk in &table.foreign_keys {
                let node = NodeRef::ForeignKey(table, fk).path().to_string();
                let target_name = fk
                    .referenced_table()
                    .ok_or_else(|| CloneError::configuration(&node, "no referenced columns"))?;
                let target = self.table(&target_name).ok_or_else(|| {
                    CloneError::configuration(&node, format!("referenced table {target_name} does not exist"))
                })?;
                let mut referenced: Vec<String> = fk
                    .referenced_columns
                    .iter()
                    .map(|c| c.column_name.clone())
                    .collect();
                referenced.sort();
                if target.key(&referenced).is_none() {
                    return Err(CloneError::configuration(
                        &node,
                        format!("referenced columns ({}) are not a key of {target_name}", referenced.join(", ")),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Tables connected to `root` through foreign keys in either direction.
    ///
    /// Pure model traversal; `root` is included when it exists.
    pub fn connected_tables(&self, root: &TableName) -> BTreeSet<TableName> {
        let mut edges: BTreeMap<TableName, BTreeSet<TableName>> = BTreeMap::new();
        for table in self.tables() {
            for fk in &table.foreign_keys {
                if let Some(target) = fk.referenced_table() {
                    edges.entry(table.name()).or_default().insert(target.clone());
                    edges.entry(target).or_default().insert(table.name());
                }
            }
        }

        let mut connected = BTreeSet::new();
        if self.table(root).is_none() {
            return connected;
        }
        let mut pending = vec![root.clone()];
        while let Some(current) = pending.pop() {
            if !connected.insert(current.clone()) {
                continue;
            }
            if let Some(next) = edges.get(&current) {
                pending.extend(next.iter().filter(|t| !connected.contains(*t)).cloned());
            }
        }
        connected
    }

    /// Sha256 hex fingerprint of the canonical model document.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| CloneError::Internal(format!("model serialization failed: {e}")))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}
