//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{Category, ReportRow, Watermark};

/// Durable per-category ingestion progress
///
/// Implementations must allow concurrent writes for distinct categories.
pub trait WatermarkStore: Send + Sync {
    /// Get the watermark for a category
    fn get(&self, category: Category) -> Result<Option<Watermark>>;

    /// Save a watermark (upsert, replacing any previous value)
    fn set(&self, watermark: Watermark) -> Result<()>;

    /// All stored watermarks, in category order
    fn list(&self) -> Result<Vec<Watermark>>;

    /// Delete the watermark for a category, forcing a full backfill next run
    fn reset(&self, category: Category) -> Result<()>;

    /// Store a new watermark only if it is strictly newer than the stored one
    ///
    /// Returns whether the watermark moved.
    fn advance(
        &self,
        category: Category,
        high_water_mark: DateTime<Utc>,
        record_count: usize,
        note: &str,
    ) -> Result<bool> {
        if let Some(current) = self.get(category)?
            && !current.is_superseded_by(high_water_mark)
        {
            return Ok(false);
        }
        self.set(Watermark::new(category, high_water_mark, record_count, note))?;
        Ok(true)
    }
}

/// Persisted report rows
pub trait ReportStore: Send + Sync {
    /// Insert or replace a batch of rows for one category.
    ///
    /// The batch is written atomically: either every row lands or none do.
    /// Returns the number of rows written.
    fn upsert_rows(&self, category: Category, rows: &[ReportRow]) -> Result<usize>;

    /// Count stored rows for a category
    fn count_rows(&self, category: Category) -> Result<usize>;

    /// Get one row by key
    fn get_row(&self, category: Category, row_key: &str) -> Result<Option<ReportRow>>;
}
