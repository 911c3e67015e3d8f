//! Configuration and data directories for Tally
//!
//! Settings and OAuth material live in the config directory (~/.config/tally/).
//! The ingestion database and downloaded report files live in the data
//! directory (~/.local/share/tally/).
//!
//! Call [`init`] at application startup to bootstrap both directories.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "tally";

/// Initialize the Tally config and data directories.
///
/// Returns the config directory. Call this once at application startup.
pub fn init() -> Result<PathBuf> {
    ensure_dir(data_dir())?;
    ensure_dir(config_dir())
}

/// Get the Tally config directory (~/.config/tally/)
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// Get the Tally data directory (~/.local/share/tally/)
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

/// Get the path to a config file within the Tally config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Get the path to a file or directory within the Tally data directory
pub fn data_path(name: &str) -> Option<PathBuf> {
    data_dir().map(|p| p.join(name))
}

/// Load and parse a JSON config file from the Tally config directory
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    load_json_file(&path)
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Check if a config file exists in the Tally config directory
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Save a value as pretty-printed JSON to an arbitrary path
pub fn save_json_file<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

fn ensure_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = dir.context("Could not determine home directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    Ok(dir)
}
