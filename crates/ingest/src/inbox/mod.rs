//! Inbox poller boundary
//!
//! This module provides:
//! - The `InboxPoller` trait consumed by the poll loop
//! - Archive expansion for downloaded attachments
//! - A Gmail-backed poller (OAuth2, search, attachment download)

pub mod archive;
pub mod gmail;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::models::{AttachmentKey, InboxMessage};

pub use gmail::GmailInboxPoller;

/// Searches the monitored mailbox and fetches attachments
pub trait InboxPoller: Send + Sync {
    /// Messages received at or after `since`
    ///
    /// Must be safe to call repeatedly. Results may include messages that
    /// were already returned by an earlier call; callers de-duplicate by id.
    fn find_messages_since(&self, since: DateTime<Utc>) -> Result<Vec<InboxMessage>>;

    /// Download every attachment of a message to local files
    ///
    /// Archive attachments are expanded: the returned map holds the
    /// contained files (keyed `archive.zip/inner.csv`), not the archive.
    fn download_attachments(&self, message: &InboxMessage)
    -> Result<BTreeMap<AttachmentKey, PathBuf>>;
}
