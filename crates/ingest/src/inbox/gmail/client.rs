//! Gmail API HTTP client
//!
//! Provides methods for searching messages and fetching attachments.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use anyhow::{Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::GmailAuth;
use super::api::{AttachmentBody, GmailMessage, ListMessagesResponse};
use crate::models::MessageId;

/// Attachments are returned inline as base64; exports can be large
const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

/// Gmail API client for the monitored mailbox
pub struct GmailClient {
    auth: GmailAuth,
    max_retries: u32,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    pub fn new(auth: GmailAuth) -> Self {
        Self {
            auth,
            max_retries: 3,
        }
    }

    /// Search message IDs
    ///
    /// # Arguments
    /// * `query` - Gmail search expression (same syntax as the search box)
    /// * `max_results` - Maximum number of messages per page (1-500)
    /// * `page_token` - Optional page token for pagination
    pub fn list_messages(
        &self,
        query: &str,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse> {
        let mut url = format!(
            "{}/users/me/messages?q={}&maxResults={}",
            Self::BASE_URL,
            urlencoding::encode(query),
            max_results.clamp(1, 500)
        );

        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        self.with_retry("list messages", || self.get_json(&url))
    }

    /// Get full message details by ID
    pub fn get_message(&self, id: &MessageId) -> Result<GmailMessage> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            Self::BASE_URL,
            id.as_str()
        );
        self.with_retry("get message", || self.get_json(&url))
    }

    /// Fetch one attachment's base64url content
    pub fn get_attachment(&self, message_id: &MessageId, attachment_id: &str) -> Result<AttachmentBody> {
        let url = format!(
            "{}/users/me/messages/{}/attachments/{}",
            Self::BASE_URL,
            message_id.as_str(),
            attachment_id
        );
        self.with_retry("get attachment", || self.get_json(&url))
    }

    /// Trigger authentication flow
    pub fn authenticate(&self) -> Result<()> {
        self.auth.get_access_token()?;
        Ok(())
    }

    /// Check if the client is authenticated
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// Clear stored tokens
    pub fn logout(&self) -> Result<()> {
        self.auth.logout()
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let access_token = self.auth.get_access_token()?;

        let mut response = ureq::get(url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .with_context(|| format!("Request failed: {}", url))?;

        let body = response
            .body_mut()
            .with_config()
            .limit(MAX_RESPONSE_BYTES)
            .read_to_string()
            .context("Failed to read response body")?;

        serde_json::from_str(&body).context("Failed to parse Gmail API response")
    }

    /// Run a request with exponential backoff retry
    fn with_retry<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = Duration::from_millis(100);
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_retries => {
                    return Err(e.context(format!("{} failed after {} attempts", what, attempt)));
                }
                Err(e) => {
                    debug!("{} attempt {} failed: {:#}", what, attempt, e);
                    let jitter = Duration::from_millis(rand_jitter());
                    std::thread::sleep(delay + jitter);
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}
