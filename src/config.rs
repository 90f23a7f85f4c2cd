//! Configuration for a catalog clone.
//!
//! [`CloneConfig`] is passed to [`CloneEngine::new()`](crate::CloneEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use catalog_replication::config::{CloneConfig, CopyMode};
//!
//! let mut config = CloneConfig {
//!     exclude_schemas: vec!["scratch".into()],
//!     ..Default::default()
//! };
//! config.copy.mode = CopyMode::Sequential;
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CloneConfig
//! ├── copy_data / copy_annotations / copy_policy / truncate_after
//! ├── exclude_schemas: Vec<String>   # never diffed or copied
//! ├── root_table: Option<String>     # restrict data copy to FK-connected tables
//! ├── copy: CopyConfig               # paging, pipelining, fan-out
//! └── config_sync: ConfigSyncConfig  # concurrent-update retries
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! copy_policy: false
//! exclude_schemas: ["scratch"]
//!
//! copy:
//!   page_size: 5000
//!   pipeline_depth: 4
//!   table_concurrency: 8
//!   mode: pipelined
//!
//! config_sync:
//!   max_attempts: 5
//!   retry_delay: "250ms"
//! ```

use crate::error::{CloneError, Result};
use crate::model::TableName;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from caller to CloneEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level clone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Copy table contents.
    #[serde(default = "default_true")]
    pub copy_data: bool,

    /// Copy annotations (catalog-level and per node).
    #[serde(default = "default_true")]
    pub copy_annotations: bool,

    /// Copy ACLs and ACL bindings. Requires ownership of the source.
    #[serde(default = "default_true")]
    pub copy_policy: bool,

    /// Truncate destination history after a fully successful run.
    #[serde(default = "default_true")]
    pub truncate_after: bool,

    /// Schemas left out of the clone entirely.
    #[serde(default)]
    pub exclude_schemas: Vec<String>,

    /// `schema:table` whose FK-connected component bounds the data copy.
    #[serde(default)]
    pub root_table: Option<String>,

    #[serde(default)]
    pub copy: CopyConfig,

    #[serde(default)]
    pub config_sync: ConfigSyncConfig,
}

fn default_true() -> bool {
    true
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            copy_data: true,
            copy_annotations: true,
            copy_policy: true,
            truncate_after: true,
            exclude_schemas: Vec::new(),
            root_table: None,
            copy: CopyConfig::default(),
            config_sync: ConfigSyncConfig::default(),
        }
    }
}

impl CloneConfig {
    /// Small pages and fast retries for tests.
    pub fn for_testing() -> Self {
        Self {
            copy: CopyConfig::testing(),
            config_sync: ConfigSyncConfig::testing(),
            ..Default::default()
        }
    }

    /// Reject settings that cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.copy.page_size == 0 {
            return Err(CloneError::configuration("copy.page_size", "must be at least 1"));
        }
        if self.copy.pipeline_depth == 0 {
            return Err(CloneError::configuration("copy.pipeline_depth", "must be at least 1"));
        }
        if self.copy.table_concurrency == 0 {
            return Err(CloneError::configuration("copy.table_concurrency", "must be at least 1"));
        }
        if self.copy.max_pages_per_sec == Some(0) {
            return Err(CloneError::configuration("copy.max_pages_per_sec", "must be at least 1"));
        }
        if self.config_sync.max_attempts == 0 {
            return Err(CloneError::configuration("config_sync.max_attempts", "must be at least 1"));
        }
        if let Err(e) = humantime::parse_duration(&self.config_sync.retry_delay) {
            return Err(CloneError::configuration(
                "config_sync.retry_delay",
                format!("{:?} is not a duration: {e}", self.config_sync.retry_delay),
            ));
        }
        self.root_table()?;
        Ok(())
    }

    /// Parsed `root_table`.
    pub fn root_table(&self) -> Result<Option<TableName>> {
        self.root_table.as_deref().map(TableName::parse).transpose()
    }

    pub fn is_excluded(&self, schema: &str) -> bool {
        self.exclude_schemas.iter().any(|s| s == schema)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CopyConfig: paging, pipelining and fan-out
// ═══════════════════════════════════════════════════════════════════════════════

/// How row data is moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyMode {
    /// One table at a time, one page at a time.
    Sequential,
    /// Overlapped fetch/upload per table, several tables concurrently.
    Pipelined,
}

/// Data copy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Rows per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Pages buffered between producer and consumer.
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,

    /// Tables copied concurrently in pipelined mode.
    #[serde(default = "default_table_concurrency")]
    pub table_concurrency: usize,

    #[serde(default = "default_mode")]
    pub mode: CopyMode,

    /// Throttle on source page fetches. `None` = unthrottled.
    #[serde(default)]
    pub max_pages_per_sec: Option<u32>,
}

fn default_page_size() -> usize {
    10_000
}

fn default_pipeline_depth() -> usize {
    3
}

fn default_table_concurrency() -> usize {
    5
}

fn default_mode() -> CopyMode {
    CopyMode::Pipelined
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            pipeline_depth: 3,
            table_concurrency: 5,
            mode: CopyMode::Pipelined,
            max_pages_per_sec: None,
        }
    }
}

impl CopyConfig {
    pub fn testing() -> Self {
        Self {
            page_size: 2,
            pipeline_depth: 2,
            table_concurrency: 2,
            mode: CopyMode::Pipelined,
            max_pages_per_sec: None,
        }
    }

    /// Source fetch rate, if throttled.
    pub fn fetch_rate(&self) -> Option<NonZeroU32> {
        self.max_pages_per_sec.and_then(NonZeroU32::new)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConfigSyncConfig: configuration synchronizer retries
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry policy for concurrent-update failures while applying configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSyncConfig {
    /// Attempts per node, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Base delay between attempts (humantime, e.g. "200ms").
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
}

fn default_max_attempts() -> usize {
    5
}

fn default_retry_delay() -> String {
    "200ms".to_string()
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: "200ms".to_string(),
        }
    }
}

impl ConfigSyncConfig {
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: "1ms".to_string(),
        }
    }

    /// Parse the retry_delay string to a Duration. Falls back to 200ms;
    /// [`CloneConfig::validate`] rejects strings that do not parse.
    pub fn retry_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_delay).unwrap_or(Duration::from_millis(200))
    }

    /// Backoff schedule derived from these settings.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::doubling(self.max_attempts, self.retry_delay_duration())
    }
}
