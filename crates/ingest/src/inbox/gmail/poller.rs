//! Gmail-backed inbox poller

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use super::normalize::INLINE_PREFIX;
use super::{GmailClient, decode_base64, normalize_message};
use crate::inbox::InboxPoller;
use crate::inbox::archive::{DownloadedFile, expand_downloads, sanitize_filename};
use crate::models::{AttachmentKey, InboxMessage, MessageId};

/// Searches one Gmail mailbox for report deliveries
pub struct GmailInboxPoller {
    client: GmailClient,
    address: String,
    query: String,
    download_dir: PathBuf,
    page_size: usize,
    max_pages: usize,
}

impl GmailInboxPoller {
    /// # Arguments
    /// * `address` - Mailbox address reports are delivered to
    /// * `query` - Extra Gmail search terms, e.g. `has:attachment`
    /// * `download_dir` - Attachments land in a per-message subdirectory
    pub fn new(
        client: GmailClient,
        address: impl Into<String>,
        query: impl Into<String>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            address: address.into(),
            query: query.into(),
            download_dir: download_dir.into(),
            page_size: 100,
            max_pages: 10,
        }
    }

    fn fetch_content(&self, id: &MessageId, content_ref: &str) -> Result<Vec<u8>> {
        let encoded = match content_ref.strip_prefix(INLINE_PREFIX) {
            Some(inline) => inline.to_string(),
            None => self.client.get_attachment(id, content_ref)?.data,
        };
        decode_base64(&encoded).context("Attachment data is not valid base64")
    }
}

/// Gmail search expression for deliveries since a moment
///
/// `after:` takes epoch seconds and is exclusive at second granularity.
pub fn build_query(address: &str, query: &str, since: DateTime<Utc>) -> String {
    let mut terms = Vec::new();
    if !address.is_empty() {
        terms.push(format!("deliveredto:{}", address));
    }
    if !query.trim().is_empty() {
        terms.push(query.trim().to_string());
    }
    terms.push(format!("after:{}", since.timestamp().saturating_sub(1).max(0)));
    terms.join(" ")
}

impl InboxPoller for GmailInboxPoller {
    fn find_messages_since(&self, since: DateTime<Utc>) -> Result<Vec<InboxMessage>> {
        let query = build_query(&self.address, &self.query, since);
        debug!("Searching mailbox: {}", query);

        let mut refs = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..self.max_pages {
            let response = self
                .client
                .list_messages(&query, self.page_size, page_token.as_deref())?;
            refs.extend(response.messages.unwrap_or_default());

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let mut messages = Vec::with_capacity(refs.len());
        for message_ref in refs {
            let id = MessageId::new(message_ref.id);
            // Skipped messages are found again by the next search
            let fetched = self
                .client
                .get_message(&id)
                .and_then(normalize_message);
            match fetched {
                Ok(message) if message.received_at >= since => messages.push(message),
                Ok(_) => {}
                Err(e) => warn!("Skipping message {}: {:#}", id.as_str(), e),
            }
        }

        Ok(messages)
    }

    fn download_attachments(
        &self,
        message: &InboxMessage,
    ) -> Result<BTreeMap<AttachmentKey, PathBuf>> {
        let dir = self.download_dir.join(sanitize_filename(message.id.as_str()));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut files = Vec::with_capacity(message.attachments.len());
        for (i, attachment) in message.attachments.iter().enumerate() {
            let bytes = self
                .fetch_content(&message.id, &attachment.content_ref)
                .with_context(|| format!("Failed to download {}", attachment.filename))?;

            let mut filename = attachment.filename.clone();
            if files.iter().any(|f: &DownloadedFile| f.filename == filename) {
                filename = format!("{}-{}", i, filename);
            }
            let path = dir.join(sanitize_filename(&filename));
            fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;

            debug!(
                "Downloaded {} ({} bytes) from message {}",
                attachment.filename,
                bytes.len(),
                message.id.as_str()
            );
            files.push(DownloadedFile {
                filename,
                mime_type: attachment.mime_type.clone(),
                path,
            });
        }

        expand_downloads(files, &dir)
    }
}
