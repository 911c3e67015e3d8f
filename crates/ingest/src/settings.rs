//! Runtime settings and credentials
//!
//! Settings are read from `settings.json` in the config directory (all
//! fields optional), then overlaid by environment variables:
//! `TALLY_PLATFORM_USERNAME`, `TALLY_PLATFORM_PASSWORD`,
//! `TALLY_MAILBOX_ADDRESS`, `TALLY_TRIGGER_COMMAND`.
//!
//! Mailbox OAuth credentials are loaded from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (Google Cloud Console format)
//! 3. Runtime environment variables (fallback)

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::RunOptions;
use crate::trigger::PlatformCredentials;

/// Settings filename in the config directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Credentials filename in the config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// All runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub platform: PlatformSettings,
    pub mailbox: MailboxSettings,
    pub polling: PollingSettings,
    /// Window start for categories that were never ingested
    pub backfill_floor: NaiveDate,
    /// Defaults to `tally.db` in the data directory
    pub database_path: Option<PathBuf>,
    /// Defaults to `downloads/` in the data directory
    pub download_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            platform: PlatformSettings::default(),
            mailbox: MailboxSettings::default(),
            polling: PollingSettings::default(),
            backfill_floor: default_backfill_floor(),
            database_path: None,
            download_dir: None,
        }
    }
}

pub fn default_backfill_floor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub username: String,
    pub password: String,
    /// Automation program and arguments
    pub trigger_command: Vec<String>,
}

impl fmt::Debug for PlatformSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformSettings")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("trigger_command", &self.trigger_command)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxSettings {
    /// Address the platform delivers exports to
    pub address: String,
    /// Extra Gmail search terms
    pub search_query: String,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            search_query: "has:attachment".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub timeout_secs: u64,
    pub interval_secs: u64,
    /// Subtracted from the trigger time to anchor inbox searches
    pub safety_margin_secs: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 45 * 60,
            interval_secs: 30,
            safety_margin_secs: 5 * 60,
        }
    }
}

impl Settings {
    /// Load settings from the config directory and the environment
    pub fn load() -> Result<Self> {
        let settings = if config::config_exists(SETTINGS_FILE) {
            config::load_json(SETTINGS_FILE)?
        } else {
            Self::default()
        };
        Ok(settings.with_env(|key| std::env::var(key).ok()))
    }

    /// Load settings from a specific file (no environment overlay)
    pub fn load_from(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    /// Overlay values from an environment lookup
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(username) = non_empty("TALLY_PLATFORM_USERNAME") {
            self.platform.username = username;
        }
        if let Some(password) = non_empty("TALLY_PLATFORM_PASSWORD") {
            self.platform.password = password;
        }
        if let Some(address) = non_empty("TALLY_MAILBOX_ADDRESS") {
            self.mailbox.address = address;
        }
        if let Some(command) = non_empty("TALLY_TRIGGER_COMMAND") {
            self.platform.trigger_command = command.split_whitespace().map(String::from).collect();
        }
        self
    }

    pub fn platform_credentials(&self) -> PlatformCredentials {
        PlatformCredentials::new(&self.platform.username, &self.platform.password)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => config::data_path("tally.db").context("Could not determine data directory"),
        }
    }

    pub fn download_dir(&self) -> Result<PathBuf> {
        match &self.download_dir {
            Some(path) => Ok(path.clone()),
            None => config::data_path("downloads").context("Could not determine data directory"),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            mailbox: self.mailbox.address.clone(),
            poll_timeout: Duration::from_secs(self.polling.timeout_secs),
            poll_interval: Duration::from_secs(self.polling.interval_secs),
            safety_margin: Duration::from_secs(self.polling.safety_margin_secs),
            backfill_floor: self.backfill_floor,
        }
    }
}

/// OAuth credentials for Gmail API access
#[derive(Clone)]
pub struct MailboxCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for MailboxCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Google Cloud Console credential file format (installed app)
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl MailboxCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials (for production builds)
    /// 2. JSON file (~/.config/tally/google-credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: GOOGLE_CLIENT_ID=xxx GOOGLE_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Support both "installed" (desktop) and "web" credential types
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    /// Get the default credentials file path (~/.config/tally/google-credentials.json)
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}
