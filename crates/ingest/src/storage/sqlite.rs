//! SQLite-based storage for watermarks and report rows

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::{ReportStore, WatermarkStore};
use crate::models::{Category, DateRange, ReportRow, Watermark};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- One watermark per category, overwritten in place
            CREATE TABLE watermarks (
                category TEXT PRIMARY KEY,
                high_water_mark TEXT NOT NULL,
                record_count INTEGER NOT NULL DEFAULT 0,
                note TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );

            -- Report rows keyed by category and natural key
            CREATE TABLE report_rows (
                category TEXT NOT NULL,
                row_key TEXT NOT NULL,
                occurred_at TEXT,
                period_start TEXT,
                period_end TEXT,
                fields TEXT NOT NULL,  -- JSON object of column -> value
                ingested_at TEXT NOT NULL,
                PRIMARY KEY (category, row_key)
            );

            CREATE INDEX idx_report_rows_occurred_at
                ON report_rows(category, occurred_at DESC);
            "#,
        ),
    ])
}

/// SQLite-backed [`WatermarkStore`] and [`ReportStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets progress readers proceed while a category batch commits
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;

        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection lock poisoned"))
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid stored timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn parse_category(s: &str) -> Result<Category> {
    s.parse().map_err(anyhow::Error::from)
}

type WatermarkColumns = (String, String, i64, String, String);

fn read_watermark_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatermarkColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn row_to_watermark(
    (category, high_water_mark, record_count, note, updated_at): WatermarkColumns,
) -> Result<Watermark> {
    Ok(Watermark {
        category: parse_category(&category)?,
        high_water_mark: parse_timestamp(&high_water_mark)?,
        record_count: record_count as usize,
        note,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

impl WatermarkStore for SqliteStore {
    fn get(&self, category: Category) -> Result<Option<Watermark>> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                "SELECT category, high_water_mark, record_count, note, updated_at
                 FROM watermarks WHERE category = ?",
                [category.as_str()],
                read_watermark_columns,
            )
            .optional()?;

        row.map(row_to_watermark).transpose()
    }

    fn set(&self, watermark: Watermark) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT OR REPLACE INTO watermarks
             (category, high_water_mark, record_count, note, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                watermark.category.as_str(),
                watermark.high_water_mark.to_rfc3339(),
                watermark.record_count as i64,
                watermark.note,
                watermark.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    fn list(&self) -> Result<Vec<Watermark>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT category, high_water_mark, record_count, note, updated_at FROM watermarks",
        )?;
        let rows = stmt
            .query_map([], read_watermark_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut watermarks = rows
            .into_iter()
            .map(row_to_watermark)
            .collect::<Result<Vec<_>>>()?;
        watermarks.sort_by_key(|w| w.category);
        Ok(watermarks)
    }

    fn reset(&self, category: Category) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM watermarks WHERE category = ?", [category.as_str()])?;
        Ok(())
    }
}

impl ReportStore for SqliteStore {
    fn upsert_rows(&self, category: Category, rows: &[ReportRow]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ingested_at = Utc::now().to_rfc3339();

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO report_rows
                 (category, row_key, occurred_at, period_start, period_end, fields, ingested_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;

            for row in rows {
                let fields = serde_json::to_string(&row.fields)?;
                stmt.execute(params![
                    category.as_str(),
                    row.row_key,
                    row.occurred_at.map(|t| t.to_rfc3339()),
                    row.period.map(|p| p.start.to_string()),
                    row.period.map(|p| p.end.to_string()),
                    fields,
                    ingested_at,
                ])?;
            }
        }

        tx.commit()
            .with_context(|| format!("Failed to commit rows for {}", category))?;
        Ok(rows.len())
    }

    fn count_rows(&self, category: Category) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM report_rows WHERE category = ?",
            [category.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get_row(&self, category: Category, row_key: &str) -> Result<Option<ReportRow>> {
        let conn = self.conn()?;

        let row: Option<(String, Option<String>, Option<String>, Option<String>, String)> = conn
            .query_row(
                "SELECT row_key, occurred_at, period_start, period_end, fields
                 FROM report_rows WHERE category = ? AND row_key = ?",
                params![category.as_str(), row_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let Some((row_key, occurred_at, period_start, period_end, fields_json)) = row else {
            return Ok(None);
        };

        let period = match (period_start, period_end) {
            (Some(start), Some(end)) => DateRange::new(
                start.parse::<NaiveDate>()?,
                end.parse::<NaiveDate>()?,
            ),
            _ => None,
        };

        Ok(Some(ReportRow {
            category,
            row_key,
            occurred_at: occurred_at.as_deref().map(parse_timestamp).transpose()?,
            period,
            fields: serde_json::from_str(&fields_json)?,
        }))
    }
}
