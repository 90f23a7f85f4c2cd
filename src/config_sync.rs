// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration synchronizer.
//!
//! Propagates comments, annotations, ACLs and ACL bindings from every
//! source node to the matching destination node. A field is only PUT when
//! the destination value is not structurally [`equivalent`] to the source
//! value, so a second pass over an unchanged source issues no PUTs.
//!
//! # Comparators
//!
//! | Field                     | Comparator                           |
//! |---------------------------|--------------------------------------|
//! | comment, annotations      | [`Comparator::Generic`]              |
//! | catalog ACLs              | [`Comparator::CatalogAcls`]          |
//! | other ACLs                | [`Comparator::Acls`]                 |
//! | ACL bindings              | [`Comparator::AclBindings`]          |
//!
//! The specialized comparators fill in server-side defaults before
//! comparing, so defaulted fields do not register as differences.
//!
//! # Concurrent updates
//!
//! A precondition failure on a PUT means the destination changed under us.
//! The destination model is re-fetched and the node retried with backoff
//! from [`RetryConfig`].

use crate::config::CloneConfig;
use crate::error::{CloneError, Result};
use crate::marker::CLONE_STATE_TAG;
use crate::metrics;
use crate::model::{CatalogModel, ConfigField, Configurable, NodeKind, NodePath, NodeRef};
use crate::resilience::RetryConfig;
use crate::service::CatalogService;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

/// Catalog ACL modes the service always reports.
const CATALOG_ACL_MODES: [&str; 6] = ["owner", "read", "write", "insert", "update", "delete"];

/// How two configuration documents are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Deep equality; object key order ignored, list order significant.
    Generic,
    /// Member lists compared as sorted lists.
    Acls,
    /// Like `Acls`, with missing catalog modes treated as empty lists.
    CatalogAcls,
    /// Bindings reduced to projection, projection type, types and scope
    /// (scope defaults to `["*"]`).
    AclBindings,
}

impl Comparator {
    /// Comparator for one field of a node kind.
    pub fn for_field(kind: NodeKind, field: ConfigField) -> Self {
        match (kind, field) {
            (NodeKind::Catalog, ConfigField::Acls) => Comparator::CatalogAcls,
            (_, ConfigField::Acls) => Comparator::Acls,
            (_, ConfigField::AclBindings) => Comparator::AclBindings,
            _ => Comparator::Generic,
        }
    }
}

/// Structural equivalence of two configuration documents.
pub fn equivalent(a: &Value, b: &Value, comparator: Comparator) -> bool {
    match comparator {
        Comparator::Generic => a == b,
        Comparator::Acls => match (a, b) {
            (Value::Object(x), Value::Object(y)) => canonical_acls(x) == canonical_acls(y),
            _ => false,
        },
        Comparator::CatalogAcls => match (a, b) {
            (Value::Object(x), Value::Object(y)) => {
                canonical_acls(&with_catalog_modes(x)) == canonical_acls(&with_catalog_modes(y))
            }
            _ => false,
        },
        Comparator::AclBindings => match (a, b) {
            (Value::Object(x), Value::Object(y)) => canonical_bindings(x) == canonical_bindings(y),
            _ => false,
        },
    }
}

fn canonical_acls(acls: &Map<String, Value>) -> Map<String, Value> {
    acls.iter()
        .map(|(mode, members)| {
            let members = match members {
                Value::Array(list) => {
                    let mut list = list.clone();
                    list.sort_by_key(|v| v.to_string());
                    Value::Array(list)
                }
                other => other.clone(),
            };
            (mode.clone(), members)
        })
        .collect()
}

fn with_catalog_modes(acls: &Map<String, Value>) -> Map<String, Value> {
    CATALOG_ACL_MODES
        .iter()
        .map(|mode| {
            let members = acls.get(*mode).cloned().unwrap_or_else(|| Value::Array(Vec::new()));
            (mode.to_string(), members)
        })
        .collect()
}

fn canonical_bindings(bindings: &Map<String, Value>) -> Map<String, Value> {
    bindings
        .iter()
        .map(|(name, binding)| {
            let canonical = match binding {
                Value::Object(b) => {
                    let field = |k: &str| b.get(k).cloned().unwrap_or(Value::Null);
                    let scope = b
                        .get("scope_acl")
                        .cloned()
                        .unwrap_or_else(|| Value::Array(vec![Value::from("*")]));
                    let mut c = Map::new();
                    c.insert("projection".into(), field("projection"));
                    c.insert("projection_type".into(), field("projection_type"));
                    c.insert("types".into(), field("types"));
                    c.insert("scope_acl".into(), scope);
                    Value::Object(c)
                }
                other => other.clone(),
            };
            (name.clone(), canonical)
        })
        .collect()
}

/// Counters of one synchronizer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Fields replaced.
    pub puts: usize,
    /// Fields already equivalent.
    pub unchanged: usize,
    /// Concurrent-update retries.
    pub retries: usize,
    /// Source nodes with no destination counterpart.
    pub missing: usize,
}

impl std::ops::AddAssign for SyncStats {
    fn add_assign(&mut self, other: Self) {
        self.puts += other.puts;
        self.unchanged += other.unchanged;
        self.retries += other.retries;
        self.missing += other.missing;
    }
}

/// Which fields are propagated.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub copy_annotations: bool,
    pub copy_policy: bool,
    pub exclude_schemas: BTreeSet<String>,
}

impl From<&CloneConfig> for SyncOptions {
    fn from(config: &CloneConfig) -> Self {
        Self {
            copy_annotations: config.copy_annotations,
            copy_policy: config.copy_policy,
            exclude_schemas: config.exclude_schemas.iter().cloned().collect(),
        }
    }
}

impl SyncOptions {
    fn copies(&self, field: ConfigField) -> bool {
        match field {
            ConfigField::Comment => true,
            ConfigField::Annotations => self.copy_annotations,
            ConfigField::Acls | ConfigField::AclBindings => self.copy_policy,
        }
    }

    fn excludes(&self, path: &NodePath) -> bool {
        let schema = match path {
            NodePath::Catalog => return false,
            NodePath::Schema { schema } => schema,
            NodePath::Table(t)
            | NodePath::Column { table: t, .. }
            | NodePath::Key { table: t, .. }
            | NodePath::ForeignKey { table: t, .. } => &t.schema,
        };
        self.exclude_schemas.contains(schema)
    }
}

/// Applies node configuration to a destination service.
pub struct ConfigSynchronizer<'a, D: CatalogService + ?Sized> {
    dst: &'a D,
    options: SyncOptions,
    retry: RetryConfig,
}

impl<'a, D: CatalogService + ?Sized> ConfigSynchronizer<'a, D> {
    pub fn new(dst: &'a D, options: SyncOptions, retry: RetryConfig) -> Self {
        Self { dst, options, retry }
    }

    /// Apply only the catalog-level annotations and ACLs.
    #[instrument(skip_all, fields(dst = %self.dst.name()))]
    pub async fn apply_catalog(&self, src: &CatalogModel) -> Result<SyncStats> {
        let mut dst_model = self.fetch_destination().await?;
        let mut stats = SyncStats::default();
        self.apply_node(NodeRef::Catalog(src), &mut dst_model, &mut stats).await?;
        debug!(puts = stats.puts, "Catalog configuration applied");
        Ok(stats)
    }

    /// Apply configuration of every source node, parents first.
    #[instrument(skip_all, fields(dst = %self.dst.name()))]
    pub async fn apply_all(&self, src: &CatalogModel) -> Result<SyncStats> {
        let mut dst_model = self.fetch_destination().await?;
        let mut stats = SyncStats::default();
        for node in src.nodes() {
            if self.options.excludes(&node.path()) {
                continue;
            }
            self.apply_node(node, &mut dst_model, &mut stats).await?;
        }
        metrics::record_config_unchanged(stats.unchanged);
        info!(
            puts = stats.puts,
            unchanged = stats.unchanged,
            retries = stats.retries,
            missing = stats.missing,
            "Configuration synchronized"
        );
        Ok(stats)
    }

    async fn fetch_destination(&self) -> Result<CatalogModel> {
        self.dst
            .get_model()
            .await
            .map_err(|e| CloneError::service("read destination model", e))
    }

    /// Fields of `src` that differ from `dst`, with their desired values.
    fn changes(&self, src: &NodeRef<'_>, dst: &NodeRef<'_>) -> (Vec<(ConfigField, Value)>, usize) {
        let kind = src.kind();
        let mut changes = Vec::new();
        let mut unchanged = 0;
        for field in ConfigField::ALL {
            if !kind.supports(field) || !self.options.copies(field) {
                continue;
            }
            let mut want = src.config().field_value(field);
            let have = dst.config().field_value(field);
            if kind == NodeKind::Table && field == ConfigField::Annotations {
                preserve_marker(&mut want, &have);
            }
            if equivalent(&want, &have, Comparator::for_field(kind, field)) {
                unchanged += 1;
            } else {
                changes.push((field, want));
            }
        }
        (changes, unchanged)
    }

    async fn apply_node(&self, src: NodeRef<'_>, dst_model: &mut CatalogModel, stats: &mut SyncStats) -> Result<()> {
        let path = src.path();
        let kind = src.kind();
        let mut attempt = 1;
        loop {
            let Some(dst) = dst_model.node(&path) else {
                debug!(node = %path, "No destination node, skipping configuration");
                stats.missing += 1;
                return Ok(());
            };
            let (changes, unchanged) = self.changes(&src, &dst);

            match self.put_changes(&path, kind, changes).await {
                Ok(puts) => {
                    stats.puts += puts;
                    stats.unchanged += unchanged;
                    return Ok(());
                }
                Err(CloneError::ConcurrentUpdate { .. }) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(node = %path, attempt, delay_ms = delay.as_millis() as u64, "Concurrent update, retrying");
                    metrics::record_config_retry(node_kind_label(kind));
                    stats.retries += 1;
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    *dst_model = self.fetch_destination().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn put_changes(&self, path: &NodePath, kind: NodeKind, changes: Vec<(ConfigField, Value)>) -> Result<usize> {
        let mut puts = 0;
        for (field, value) in changes {
            debug!(node = %path, field = %field, "Replacing configuration");
            self.dst
                .put_config(path.clone(), field, value)
                .await
                .map_err(|e| CloneError::service(format!("{path} {field}"), e))?;
            metrics::record_config_put(node_kind_label(kind), field.as_str());
            puts += 1;
        }
        Ok(puts)
    }
}

/// Keep the destination's own progress marker in a replacement annotation map.
fn preserve_marker(want: &mut Value, have: &Value) {
    let Value::Object(want) = want else {
        return;
    };
    match have.get(CLONE_STATE_TAG) {
        Some(marker) => {
            want.insert(CLONE_STATE_TAG.to_string(), marker.clone());
        }
        None => {
            want.remove(CLONE_STATE_TAG);
        }
    }
}

fn node_kind_label(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Catalog => "catalog",
        NodeKind::Schema => "schema",
        NodeKind::Table => "table",
        NodeKind::Column => "column",
        NodeKind::Key => "key",
        NodeKind::ForeignKey => "foreign_key",
    }
}
