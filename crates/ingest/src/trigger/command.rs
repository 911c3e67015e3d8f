//! Trigger driver that delegates to an external automation program
//!
//! The program receives a JSON request on stdin:
//!
//! ```json
//! {
//!   "username": "...", "password": "...",
//!   "download_dir": "/var/lib/tally/downloads",
//!   "windows": { "orders": { "start": "05/01/2024", "end": "05/31/2024" } }
//! }
//! ```
//!
//! and must print a [`TriggerReport`] as JSON on stdout (as the whole output
//! or as its last line). Relative direct-file paths are resolved against
//! `download_dir`.

use anyhow::{Context, Result, bail};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{PlatformCredentials, TriggerDriver};
use crate::models::{Category, DateRange, TriggerReport};

#[derive(Serialize)]
struct TriggerRequest<'a> {
    username: &'a str,
    password: &'a str,
    download_dir: &'a Path,
    windows: BTreeMap<Category, WindowRequest>,
}

#[derive(Serialize)]
struct WindowRequest {
    start: String,
    end: String,
}

/// Runs a configured program to perform the platform UI actions
pub struct CommandTriggerDriver {
    program: PathBuf,
    args: Vec<String>,
    download_dir: PathBuf,
}

impl CommandTriggerDriver {
    /// Create a driver from a command line (`program arg1 arg2 ...`)
    pub fn new(command: &[String], download_dir: impl Into<PathBuf>) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Trigger command is empty")?;

        Ok(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
            download_dir: download_dir.into(),
        })
    }

    fn request_json(
        &self,
        credentials: &PlatformCredentials,
        windows: &BTreeMap<Category, DateRange>,
    ) -> Result<Vec<u8>> {
        let request = TriggerRequest {
            username: &credentials.username,
            password: &credentials.password,
            download_dir: &self.download_dir,
            windows: windows
                .iter()
                .map(|(&category, range)| {
                    let (start, end) = range.platform_format();
                    (category, WindowRequest { start, end })
                })
                .collect(),
        };
        Ok(serde_json::to_vec(&request)?)
    }

    fn resolve_paths(&self, mut report: TriggerReport) -> TriggerReport {
        for capture in &mut report.direct {
            if capture.path.is_relative() {
                capture.path = self.download_dir.join(&capture.path);
            }
        }
        report
    }
}

impl TriggerDriver for CommandTriggerDriver {
    fn trigger(
        &self,
        credentials: &PlatformCredentials,
        windows: &BTreeMap<Category, DateRange>,
    ) -> Result<TriggerReport> {
        let request = self.request_json(credentials, windows)?;

        info!(
            "Running trigger command {} for {} categories",
            self.program.display(),
            windows.len()
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start trigger command {}", self.program.display()))?;

        let mut stdin = child.stdin.take().context("Trigger command stdin unavailable")?;
        // Feed stdin from a separate thread so a chatty child cannot deadlock us
        let writer = std::thread::spawn(move || stdin.write_all(&request));

        let output = child
            .wait_with_output()
            .context("Failed to wait for trigger command")?;

        writer
            .join()
            .map_err(|_| anyhow::anyhow!("Trigger request writer panicked"))?
            .context("Failed to send request to trigger command")?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            debug!("trigger: {}", line);
        }

        if !output.status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            bail!(
                "Trigger command exited with {}: {}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            );
        }

        let report = parse_report_output(&String::from_utf8_lossy(&output.stdout))?;
        Ok(self.resolve_paths(report))
    }
}

/// Parse the driver's stdout: the whole output, or failing that its last
/// non-empty line, must be a JSON trigger report
fn parse_report_output(stdout: &str) -> Result<TriggerReport> {
    if let Ok(report) = serde_json::from_str(stdout.trim()) {
        return Ok(report);
    }

    let last = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .context("Trigger command produced no output")?;

    serde_json::from_str(last.trim()).context("Failed to parse trigger command output")
}
