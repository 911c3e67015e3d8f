//! Watermarks and date ranges for incremental ingestion

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::Category;

/// How far ingestion has progressed for one category
///
/// Persisted across runs. Overwritten only when a save observes a newer
/// high-water mark, so it always reflects data that was actually retrieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub category: Category,
    /// Timestamp of the most recent ingested record
    pub high_water_mark: DateTime<Utc>,
    /// Number of records written by the save that set this watermark
    pub record_count: usize,
    /// Free-form provenance, e.g. source file and delivery method
    pub note: String,
    /// When this watermark was written
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(
        category: Category,
        high_water_mark: DateTime<Utc>,
        record_count: usize,
        note: impl Into<String>,
    ) -> Self {
        Self {
            category,
            high_water_mark,
            record_count,
            note: note.into(),
            updated_at: Utc::now(),
        }
    }

    /// Whether `candidate` would move this watermark forward
    pub fn is_superseded_by(&self, candidate: DateTime<Utc>) -> bool {
        candidate > self.high_water_mark
    }
}

/// Inclusive calendar-day range requested from the platform
///
/// Kept as structured dates everywhere; only the trigger boundary renders
/// it in the platform's textual format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Date format the platform's export forms expect
pub const PLATFORM_DATE_FORMAT: &str = "%m/%d/%Y";

impl DateRange {
    /// Create a range, returning `None` if `start > end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// A one-day range
    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// Number of calendar days covered, inclusive of both ends
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Render as `(start, end)` strings in the platform's date format
    pub fn platform_format(&self) -> (String, String) {
        (
            self.start.format(PLATFORM_DATE_FORMAT).to_string(),
            self.end.format(PLATFORM_DATE_FORMAT).to_string(),
        )
    }
}
