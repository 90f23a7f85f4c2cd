//! Per-table progress marker.
//!
//! The marker is the only durable restart state of a clone. It lives on the
//! destination table itself, as the annotation [`CLONE_STATE_TAG`], and
//! moves through three states:
//!
//! ```text
//!   (absent / null)          1                    2
//!    Unscheduled ───────→ Started ───────→ Complete
//!                 table created      all rows confirmed
//!                 with copy_data     transferred
//! ```
//!
//! Writing the marker is never atomic with the row writes; marking complete
//! is a separate idempotent final step, done only after the last page has
//! been accepted by the destination.

use crate::error::{CloneError, Result};
use crate::model::TableName;
use crate::service::CatalogService;
use serde_json::Value;
use tracing::debug;

/// Annotation tag holding the marker.
pub const CLONE_STATE_TAG: &str = "tag:isrd.isi.edu,2018:clone-state";

/// Data-copy state of one destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressMarker {
    /// No copy scheduled (absent or null annotation).
    Unscheduled,
    /// Copy scheduled or in progress.
    Started,
    /// All rows transferred.
    Complete,
}

impl ProgressMarker {
    /// Decode the annotation value.
    pub fn from_annotation(table: &TableName, value: Option<&Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::Unscheduled),
            Some(v) => match v.as_i64() {
                Some(1) => Ok(Self::Started),
                Some(2) => Ok(Self::Complete),
                _ => Err(CloneError::configuration(
                    table.to_string(),
                    format!("unrecognized {CLONE_STATE_TAG} value {v}"),
                )),
            },
        }
    }

    /// Encode as the annotation value.
    pub fn to_annotation(self) -> Value {
        match self {
            Self::Unscheduled => Value::Null,
            Self::Started => Value::from(1),
            Self::Complete => Value::from(2),
        }
    }

    /// Initial marker of a newly created table.
    pub fn initial(copy_data: bool) -> Self {
        if copy_data {
            Self::Started
        } else {
            Self::Unscheduled
        }
    }

    pub fn needs_copy(self) -> bool {
        self == Self::Started
    }
}

impl std::fmt::Display for ProgressMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressMarker::Unscheduled => write!(f, "Unscheduled"),
            ProgressMarker::Started => write!(f, "Started"),
            ProgressMarker::Complete => write!(f, "Complete"),
        }
    }
}

/// Read the current marker of a destination table.
pub async fn read_marker<D: CatalogService + ?Sized>(dst: &D, table: &TableName) -> Result<ProgressMarker> {
    let value = dst
        .get_table_annotation(table.clone(), CLONE_STATE_TAG.to_string())
        .await
        .map_err(|e| CloneError::service(format!("get marker {table}"), e))?;
    ProgressMarker::from_annotation(table, value.as_ref())
}

/// Record that a table's rows are fully transferred.
pub async fn mark_complete<D: CatalogService + ?Sized>(dst: &D, table: &TableName) -> Result<()> {
    dst.put_table_annotation(
        table.clone(),
        CLONE_STATE_TAG.to_string(),
        ProgressMarker::Complete.to_annotation(),
    )
    .await
    .map_err(|e| CloneError::transfer(table.to_string(), format!("marker update failed: {e}")))?;
    debug!(table = %table, "Progress marker set to Complete");
    Ok(())
}
