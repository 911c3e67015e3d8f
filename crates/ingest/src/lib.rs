//! Ingest crate - Report ingestion from an operations platform
//!
//! This crate provides platform-independent ingestion logic including:
//! - Domain models (Category, Watermark, DateRange, CategoryState)
//! - Incremental date windows derived from stored watermarks
//! - Subject/filename classification of emailed exports
//! - Per-run category state tracking with first-save-wins delivery
//! - Storage trait abstractions with SQLite and in-memory backends
//! - CSV report parsing and the per-category save handler
//! - Trigger driver and inbox poller boundaries, with a command-driven
//!   trigger and a Gmail-backed poller
//! - The orchestrator tying trigger, direct saves and inbox polling together
//!
//! Everything is synchronous and executor-agnostic.

pub mod classify;
pub mod inbox;
pub mod models;
pub mod orchestrator;
pub mod save;
pub mod schema;
pub mod settings;
pub mod storage;
pub mod tracker;
pub mod trigger;
pub mod window;

pub use classify::{classify, classify_filename, classify_subject};
pub use inbox::gmail::{GmailAuth, GmailClient};
pub use inbox::{GmailInboxPoller, InboxPoller};
pub use models::{
    Attachment, AttachmentKey, Category, CategoryState, DateRange, DeliveryMethod, InboxMessage,
    MessageId, ReportRow, TriggerOutcome, TriggerReport, Watermark,
};
pub use orchestrator::{
    Clock, Collaborators, ManualClock, Orchestrator, PollStats, ProgressEvent, RunError,
    RunOptions, RunPhase, RunResult, SystemClock,
};
pub use save::{CsvSaveHandler, SaveHandler, SaveOutcome};
pub use settings::{MailboxCredentials, Settings};
pub use storage::{InMemoryStore, ReportStore, SqliteStore, WatermarkStore};
pub use tracker::{CategoryTracker, ReportFiles, StateError};
pub use trigger::{CommandTriggerDriver, PlatformCredentials, TriggerDriver};
pub use window::window_for;
