//! In-memory storage implementation
//!
//! Used by tests and dry runs; nothing survives the process.

use anyhow::{Result, anyhow};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{ReportStore, WatermarkStore};
use crate::models::{Category, ReportRow, Watermark};

/// In-memory implementation of [`WatermarkStore`] and [`ReportStore`]
///
/// Uses maps protected by RwLocks for thread-safe access.
pub struct InMemoryStore {
    watermarks: RwLock<BTreeMap<Category, Watermark>>,
    rows: RwLock<HashMap<Category, BTreeMap<String, ReportRow>>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            watermarks: RwLock::new(BTreeMap::new()),
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("In-memory store lock poisoned")
}

impl WatermarkStore for InMemoryStore {
    fn get(&self, category: Category) -> Result<Option<Watermark>> {
        let watermarks = self.watermarks.read().map_err(poisoned)?;
        Ok(watermarks.get(&category).cloned())
    }

    fn set(&self, watermark: Watermark) -> Result<()> {
        let mut watermarks = self.watermarks.write().map_err(poisoned)?;
        watermarks.insert(watermark.category, watermark);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Watermark>> {
        let watermarks = self.watermarks.read().map_err(poisoned)?;
        Ok(watermarks.values().cloned().collect())
    }

    fn reset(&self, category: Category) -> Result<()> {
        let mut watermarks = self.watermarks.write().map_err(poisoned)?;
        watermarks.remove(&category);
        Ok(())
    }
}

impl ReportStore for InMemoryStore {
    fn upsert_rows(&self, category: Category, rows: &[ReportRow]) -> Result<usize> {
        let mut all = self.rows.write().map_err(poisoned)?;
        let table = all.entry(category).or_default();
        for row in rows {
            table.insert(row.row_key.clone(), row.clone());
        }
        Ok(rows.len())
    }

    fn count_rows(&self, category: Category) -> Result<usize> {
        let all = self.rows.read().map_err(poisoned)?;
        Ok(all.get(&category).map_or(0, BTreeMap::len))
    }

    fn get_row(&self, category: Category, row_key: &str) -> Result<Option<ReportRow>> {
        let all = self.rows.read().map_err(poisoned)?;
        Ok(all.get(&category).and_then(|t| t.get(row_key)).cloned())
    }
}
