//! Inbox message snapshots used by the poll loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a mailbox message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key of one downloaded file within a message
///
/// Plain attachments are keyed by file name; files expanded from an
/// archive are keyed `archive.zip/inner.csv`.
pub type AttachmentKey = String;

/// File attachment metadata as listed by the mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Provider-specific handle used to fetch the content
    pub content_ref: String,
}

impl Attachment {
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: u64,
        content_ref: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            size_bytes,
            content_ref: content_ref.into(),
        }
    }
}

/// Read-only snapshot of a message returned by an inbox search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: MessageId,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

impl InboxMessage {
    pub fn new(id: impl Into<MessageId>, subject: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            received_at,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}
