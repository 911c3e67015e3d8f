//! Archive attachment expansion
//!
//! The platform zips large exports. Expanded entries inherit the parent
//! message's subject; only their keys and paths are produced here.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::models::AttachmentKey;

const ARCHIVE_MIME_TYPES: &[&str] = &[
    "application/zip",
    "application/x-zip",
    "application/x-zip-compressed",
];

/// An attachment that has been written to disk
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub filename: String,
    pub mime_type: String,
    pub path: PathBuf,
}

/// Whether an attachment should be expanded rather than used as-is
pub fn is_archive(filename: &str, mime_type: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(".zip")
        || ARCHIVE_MIME_TYPES
            .iter()
            .any(|m| mime_type.eq_ignore_ascii_case(m))
}

/// Replace anything that is not safe in a single path component
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Turn downloaded attachments into the files to classify
///
/// Plain files pass through keyed by their file name. Archives are
/// extracted under `dest_dir` and replaced by their entries.
pub fn expand_downloads(
    files: Vec<DownloadedFile>,
    dest_dir: &Path,
) -> Result<BTreeMap<AttachmentKey, PathBuf>> {
    let mut expanded = BTreeMap::new();

    for file in files {
        if is_archive(&file.filename, &file.mime_type) {
            let entries = extract_zip(&file.path, &file.filename, dest_dir)?;
            if entries.is_empty() {
                warn!("Archive {} contained no files", file.filename);
            }
            expanded.extend(entries);
        } else {
            expanded.insert(file.filename, file.path);
        }
    }

    Ok(expanded)
}

fn extract_zip(
    path: &Path,
    archive_name: &str,
    dest_dir: &Path,
) -> Result<Vec<(AttachmentKey, PathBuf)>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open archive {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive {}", archive_name))?;

    let stem = Path::new(archive_name)
        .file_stem()
        .map(|s| sanitize_filename(&s.to_string_lossy()))
        .unwrap_or_else(|| "archive".to_string());
    let out_dir = dest_dir.join(format!("{}.d", stem));
    fs::create_dir_all(&out_dir)?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read entry {} of {}", i, archive_name))?;

        if entry.is_dir() {
            continue;
        }

        let Some(inner) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry {:?} in {}", entry.name(), archive_name);
            continue;
        };
        let inner_name = inner.to_string_lossy().replace('\\', "/");

        let out_path = out_dir.join(sanitize_filename(&inner_name));
        let mut out = File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to extract {} from {}", inner_name, archive_name))?;

        debug!("Extracted {}/{} to {}", archive_name, inner_name, out_path.display());
        entries.push((format!("{}/{}", archive_name, inner_name), out_path));
    }

    Ok(entries)
}
