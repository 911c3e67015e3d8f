//! Parse-and-persist for one delivered category file

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

use crate::models::{Category, DateRange};
use crate::schema::{parse_report, schema_for};
use crate::storage::{ReportStore, WatermarkStore};

/// What a successful save produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    pub record_count: usize,
    /// Latest observed row timestamp, if any
    pub high_water_mark: Option<DateTime<Utc>>,
    /// Whether the stored watermark moved
    pub watermark_advanced: bool,
    /// Row-level problems that did not fail the save
    pub warnings: Vec<String>,
}

/// Parses, transforms and persists one category report.
///
/// Errors are category-scoped: the orchestrator turns them into a `Failed`
/// state for that category only.
pub trait SaveHandler: Send + Sync {
    fn save(&self, category: Category, path: &Path, window: &DateRange) -> Result<SaveOutcome>;
}

/// Save handler for the platform's CSV exports
///
/// Writes each category's rows as a single batch, then advances the
/// category's watermark to the latest timestamp actually present in the
/// file, never to the requested window.
pub struct CsvSaveHandler {
    reports: Arc<dyn ReportStore>,
    watermarks: Arc<dyn WatermarkStore>,
}

impl CsvSaveHandler {
    pub fn new(reports: Arc<dyn ReportStore>, watermarks: Arc<dyn WatermarkStore>) -> Self {
        Self {
            reports,
            watermarks,
        }
    }
}

impl SaveHandler for CsvSaveHandler {
    fn save(&self, category: Category, path: &Path, window: &DateRange) -> Result<SaveOutcome> {
        let mut report = parse_report(category, path)
            .with_context(|| format!("Failed to parse {} report {}", category, path.display()))?;

        if schema_for(category).period_tagged {
            for row in &mut report.rows {
                row.tag_period(*window);
            }
        }

        for warning in &report.warnings {
            warn!("{}", warning);
        }

        let written = self
            .reports
            .upsert_rows(category, &report.rows)
            .with_context(|| format!("Failed to store {} rows", category))?;

        let high_water_mark = report.max_timestamp();
        let watermark_advanced = match high_water_mark {
            Some(hwm) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let note = format!("{} rows from {}", written, file_name);
                self.watermarks
                    .advance(category, hwm, written, &note)
                    .with_context(|| format!("Failed to advance {} watermark", category))?
            }
            None => {
                debug!("{}: no row timestamps, watermark unchanged", category);
                false
            }
        };

        info!(
            "Saved {} {} rows from {} (watermark {})",
            written,
            category,
            path.display(),
            if watermark_advanced { "advanced" } else { "unchanged" }
        );

        Ok(SaveOutcome {
            record_count: written,
            high_water_mark,
            watermark_advanced,
            warnings: report.warnings,
        })
    }
}
