//! Parsed report rows in their storage shape

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Category, DateRange};

/// One record from a category report, ready to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub category: Category,
    /// Natural key within the category; re-ingesting the same key replaces the row
    pub row_key: String,
    /// The row's own timestamp, used to advance the watermark
    pub occurred_at: Option<DateTime<Utc>>,
    /// Reporting period, for categories whose rows are period aggregates
    pub period: Option<DateRange>,
    /// Original column values keyed by header
    pub fields: BTreeMap<String, String>,
}

impl ReportRow {
    pub fn new(category: Category, row_key: impl Into<String>) -> Self {
        Self {
            category,
            row_key: row_key.into(),
            occurred_at: None,
            period: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Stored key of a period aggregate: `{key}@{start}..{end}`
    pub fn period_key(key: &str, period: &DateRange) -> String {
        format!("{}@{}..{}", key, period.start, period.end)
    }

    /// Attach a reporting period to an aggregate row
    ///
    /// The period becomes part of the key so each period's aggregates are
    /// kept, and the period end stands in for the row timestamp.
    pub fn tag_period(&mut self, period: DateRange) {
        self.row_key = Self::period_key(&self.row_key, &period);
        self.occurred_at = period.end.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        self.period = Some(period);
    }
}
