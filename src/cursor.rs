// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row cursor for resumable paging.
//!
//! The cursor is never persisted. On every (re)start it is recomputed as the
//! largest `RID` already present in the destination table, and the copy asks
//! the source for rows strictly after it.
//!
//! # Resume Semantics
//!
//! ```text
//! source RIDs:       1  2  3  4  5
//! destination RIDs:  1  2  3            ← prior run interrupted
//!                          ▲
//!                  cursor = max(dst) = 3
//! next fetch:        RID > 3 → [4, 5]
//! ```
//!
//! Because identifiers are assigned once and preserved by every copy, this
//! is exact: nothing is fetched twice and nothing is skipped, for any
//! interruption point, provided destination writes are durable.

use crate::error::{CloneError, Result};
use crate::model::{row_id, Row, RowId, TableName};
use crate::service::CatalogService;
use tracing::debug;

/// Position of one table copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCursor {
    table: TableName,
    position: Option<RowId>,
    resumed_from: Option<RowId>,
    rows: usize,
    pages: usize,
}

impl RowCursor {
    /// Cursor starting after `position` (`None` = from the beginning).
    pub fn at(table: TableName, position: Option<RowId>) -> Self {
        Self {
            table,
            resumed_from: position.clone(),
            position,
            rows: 0,
            pages: 0,
        }
    }

    /// Recompute the cursor from the destination's current contents.
    pub async fn resume<D: CatalogService + ?Sized>(dst: &D, table: &TableName) -> Result<Self> {
        let position = dst
            .max_row_id(table.clone())
            .await
            .map_err(|e| CloneError::transfer(table.to_string(), format!("max RID query failed: {e}")))?;
        debug!(table = %table, cursor = ?position, "Cursor recomputed from destination");
        Ok(Self::at(table.clone(), position))
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Rows must be fetched strictly after this identifier.
    pub fn position(&self) -> Option<&RowId> {
        self.position.as_ref()
    }

    /// Where this copy started, for logging and reports.
    pub fn resumed_from(&self) -> Option<&RowId> {
        self.resumed_from.as_ref()
    }

    /// Rows accounted for since the cursor was created.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Move past a fetched page.
    ///
    /// Every row must carry a `RID` and the page's last identifier must be
    /// strictly greater than the current position; otherwise paging would
    /// never terminate.
    pub fn advance(&mut self, page: &[Row]) -> Result<()> {
        let Some(last) = page.last() else {
            return Ok(());
        };
        if page.iter().any(|r| row_id(r).is_none()) {
            return Err(CloneError::transfer(self.table.to_string(), "fetched row without RID"));
        }
        let last = row_id(last).ok_or_else(|| CloneError::transfer(self.table.to_string(), "fetched row without RID"))?;
        if let Some(current) = &self.position {
            if &last <= current {
                return Err(CloneError::transfer(
                    self.table.to_string(),
                    format!("cursor did not advance past {current} (page ended at {last})"),
                ));
            }
        }
        self.position = Some(last);
        self.rows += page.len();
        self.pages += 1;
        Ok(())
    }
}
