//! Fetch-window computation from watermarks
//!
//! Pure functions that can be tested without a clock or network.

use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::models::{DateRange, Watermark};

/// Compute the date range to request for a category.
///
/// # Arguments
/// * `watermark` - The category's stored watermark (None if never ingested)
/// * `now` - Current time, injected by the caller
/// * `backfill_floor` - Historical anchor used when there is no watermark
///
/// # Returns
/// `[day after watermark, today]`, or `[backfill_floor, today]` without a
/// watermark. A start that would fall after today (duplicate run, clock
/// skew, future-dated rows) collapses to `[today, today]` so the category
/// is still triggered with a valid range.
pub fn window_for(
    watermark: Option<&Watermark>,
    now: DateTime<Utc>,
    backfill_floor: NaiveDate,
) -> DateRange {
    let today = now.date_naive();

    let start = match watermark {
        Some(wm) => wm
            .high_water_mark
            .date_naive()
            .checked_add_days(Days::new(1))
            .unwrap_or(today),
        None => backfill_floor,
    };

    DateRange::new(start, today).unwrap_or_else(|| DateRange::single_day(today))
}
