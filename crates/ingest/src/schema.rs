//! Per-category CSV schemas and report parsing
//!
//! Raw file in, typed rows plus warnings out. Column lookup is by header
//! name (case-insensitive) with a list of accepted aliases per role, since
//! the platform renames columns between export screens.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

use crate::models::{Category, ReportRow};

/// How a category's export is shaped
#[derive(Debug, Clone, Copy)]
pub struct CategorySchema {
    pub category: Category,
    /// Accepted headers for the natural key, in preference order
    pub key_columns: &'static [&'static str],
    /// Accepted headers for the row timestamp, in preference order
    pub timestamp_columns: &'static [&'static str],
    /// Rows are aggregates over the requested window rather than events
    pub period_tagged: bool,
}

/// Schema for a category
pub fn schema_for(category: Category) -> CategorySchema {
    let (key_columns, timestamp_columns, period_tagged): (&[&str], &[&str], bool) = match category {
        Category::NewCustomers => (
            &["Client ID", "Customer ID", "ID"],
            &["Creation Date", "Created", "Date Added", "Date"],
            false,
        ),
        Category::Orders => (
            &["Order ID", "Sale ID", "Receipt #", "ID"],
            &["Sale Date", "Order Date", "Date"],
            false,
        ),
        Category::FirstVisits => (
            &["Client ID", "Customer ID", "ID"],
            &["First Visit Date", "Visit Date", "Date"],
            false,
        ),
        Category::ActiveSubscriptions | Category::NewSubscriptions => (
            &["Subscription ID", "Contract ID", "Client ID"],
            &["Start Date", "Created", "Date"],
            false,
        ),
        Category::PausedSubscriptions => (
            &["Subscription ID", "Contract ID", "Client ID"],
            &["Pause Date", "Paused Date", "Pause Start", "Date"],
            false,
        ),
        Category::TrialingSubscriptions => (
            &["Subscription ID", "Contract ID", "Client ID"],
            &["Trial Start Date", "Start Date", "Date"],
            false,
        ),
        Category::CanceledSubscriptions => (
            &["Subscription ID", "Contract ID", "Client ID"],
            &["Cancellation Date", "Canceled Date", "Cancelled Date", "End Date", "Date"],
            false,
        ),
        Category::FullRegistrations => (
            &["Registration ID", "Client ID", "ID"],
            &["Registration Date", "Date"],
            false,
        ),
        Category::RevenueCategories => (&["Revenue Category", "Category"], &[], true),
    };

    CategorySchema {
        category,
        key_columns,
        timestamp_columns,
        period_tagged,
    }
}

/// Errors that make a whole report unusable
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read report file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("{category} report has no key column (expected one of: {expected})")]
    MissingKeyColumn { category: Category, expected: String },
}

/// Rows parsed from one report file
#[derive(Debug, Clone)]
pub struct ParsedReport {
    pub category: Category,
    pub rows: Vec<ReportRow>,
    pub warnings: Vec<String>,
}

impl ParsedReport {
    /// Latest row timestamp, if any row carries one
    pub fn max_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.iter().filter_map(|r| r.occurred_at).max()
    }
}

/// Parse a category report from a CSV file
pub fn parse_report(category: Category, path: &Path) -> Result<ParsedReport, SchemaError> {
    let file = File::open(path)?;
    parse_reader(category, file)
}

/// Parse a category report from any reader
pub fn parse_reader<R: std::io::Read>(
    category: Category,
    reader: R,
) -> Result<ParsedReport, SchemaError> {
    let schema = schema_for(category);
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let key_idx = find_column(&headers, schema.key_columns).ok_or_else(|| {
        SchemaError::MissingKeyColumn {
            category,
            expected: schema.key_columns.join(", "),
        }
    })?;
    let ts_idx = find_column(&headers, schema.timestamp_columns);

    let mut warnings = Vec::new();
    if !schema.timestamp_columns.is_empty() && ts_idx.is_none() {
        warnings.push(format!(
            "{}: no timestamp column found; watermark will not advance",
            category
        ));
    }

    let mut rows: Vec<ReportRow> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (line, record) in rdr.records().enumerate() {
        // Header is line 1
        let line = line + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warnings.push(format!("{}: skipped malformed line {}: {}", category, line, e));
                continue;
            }
        };

        let key = record.get(key_idx).unwrap_or("");
        if key.is_empty() {
            warnings.push(format!("{}: skipped line {} with empty key", category, line));
            continue;
        }

        let mut row = ReportRow::new(category, key);
        row.fields = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect::<BTreeMap<_, _>>();

        if let Some(idx) = ts_idx {
            let raw = record.get(idx).unwrap_or("");
            row.occurred_at = parse_timestamp(raw);
            if row.occurred_at.is_none() && !raw.is_empty() {
                warnings.push(format!(
                    "{}: unparseable timestamp {:?} on line {}",
                    category, raw, line
                ));
            }
        }

        // A repeated key replaces the earlier row, as the store would
        match positions.get(key) {
            Some(&idx) => {
                warnings.push(format!(
                    "{}: duplicate key {:?} on line {}, keeping the later row",
                    category, key, line
                ));
                rows[idx] = row;
            }
            None => {
                positions.insert(key.to_string(), rows.len());
                rows.push(row);
            }
        }
    }

    Ok(ParsedReport {
        category,
        rows,
        warnings,
    })
}

fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    candidates.iter().find_map(|candidate| {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(candidate))
    })
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

// %y before %Y: %Y would read "24" as year 24, while %y rejects four digits
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y"];

/// Parse the timestamp shapes the platform emits.
///
/// Naive values are taken as UTC. Date-only values map to midnight.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}
