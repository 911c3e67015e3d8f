//! Gmail API response normalization
//!
//! Converts Gmail API messages to inbox message snapshots.

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{TimeZone, Utc};

use super::api::{GmailMessage, MessageBody, MessagePart, MessagePayload};
use crate::models::{Attachment, InboxMessage, MessageId};

/// `content_ref` prefix for small attachments Gmail returns inline
pub(crate) const INLINE_PREFIX: &str = "inline:";

/// Normalize a Gmail API message to an inbox message
pub fn normalize_message(gmail_msg: GmailMessage) -> Result<InboxMessage> {
    let payload = gmail_msg
        .payload
        .as_ref()
        .context("Message has no payload")?;

    let subject = extract_header(payload, "Subject").unwrap_or_default();

    // Milliseconds since epoch
    let internal_date: i64 = gmail_msg.internal_date.parse().unwrap_or(0);
    let received_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .unwrap_or_else(Utc::now);

    let mut attachments = Vec::new();
    if let Some(attachment) = attachment_from(
        payload.filename.as_deref(),
        payload.mime_type.as_deref(),
        payload.body.as_ref(),
    ) {
        attachments.push(attachment);
    }
    if let Some(parts) = &payload.parts {
        collect_attachments(parts, &mut attachments);
    }

    Ok(InboxMessage {
        id: MessageId::new(gmail_msg.id),
        subject,
        received_at,
        attachments,
    })
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

/// Recursively collect file parts
fn collect_attachments(parts: &[MessagePart], out: &mut Vec<Attachment>) {
    for part in parts {
        if let Some(attachment) = attachment_from(
            part.filename.as_deref(),
            part.mime_type.as_deref(),
            part.body.as_ref(),
        ) {
            out.push(attachment);
        }

        if let Some(nested) = &part.parts {
            collect_attachments(nested, out);
        }
    }
}

fn attachment_from(
    filename: Option<&str>,
    mime_type: Option<&str>,
    body: Option<&MessageBody>,
) -> Option<Attachment> {
    let filename = filename.filter(|f| !f.is_empty())?;
    let body = body?;

    let content_ref = match (&body.attachment_id, &body.data) {
        (Some(id), _) => id.clone(),
        (None, Some(data)) => format!("{}{}", INLINE_PREFIX, data),
        (None, None) => return None,
    };

    Some(Attachment::new(
        filename,
        mime_type.unwrap_or("application/octet-stream"),
        body.size.unwrap_or(0),
        content_ref,
    ))
}

/// Decode base64 attachment data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
pub fn decode_base64(data: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders.iter().find_map(|decoder| decoder.decode(data).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::gmail::api::Header;

    fn file_part(filename: &str, attachment_id: Option<&str>, data: Option<&str>) -> MessagePart {
        MessagePart {
            part_id: Some("1".into()),
            mime_type: Some("text/csv".into()),
            filename: Some(filename.into()),
            headers: None,
            body: Some(MessageBody {
                attachment_id: attachment_id.map(String::from),
                size: Some(42),
                data: data.map(String::from),
            }),
            parts: None,
        }
    }

    fn text_part() -> MessagePart {
        MessagePart {
            part_id: Some("0".into()),
            mime_type: Some("text/plain".into()),
            filename: Some(String::new()),
            headers: None,
            body: Some(MessageBody {
                attachment_id: None,
                size: Some(5),
                data: Some("aGVsbG8".into()),
            }),
            parts: None,
        }
    }

    fn message(parts: Vec<MessagePart>) -> GmailMessage {
        GmailMessage {
            id: "18f0c".into(),
            thread_id: "18f0c".into(),
            internal_date: "1714564800000".into(),
            payload: Some(MessagePayload {
                headers: Some(vec![Header {
                    name: "subject".into(),
                    value: "New Customer Export".into(),
                }]),
                body: None,
                parts: Some(parts),
                mime_type: Some("multipart/mixed".into()),
                filename: Some(String::new()),
            }),
        }
    }

    #[test]
    fn test_normalize_collects_nested_attachments() {
        let nested = MessagePart {
            part_id: Some("2".into()),
            mime_type: Some("multipart/mixed".into()),
            filename: None,
            headers: None,
            body: None,
            parts: Some(vec![file_part("orders.csv", Some("att-2"), None)]),
        };
        let msg = normalize_message(message(vec![
            text_part(),
            file_part("customers.csv", Some("att-1"), None),
            nested,
        ]))
        .unwrap();

        assert_eq!(msg.id.as_str(), "18f0c");
        assert_eq!(msg.subject, "New Customer Export");
        assert_eq!(msg.received_at, Utc.timestamp_millis_opt(1714564800000).unwrap());

        let names: Vec<&str> = msg.attachments.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["customers.csv", "orders.csv"]);
        assert_eq!(msg.attachments[0].content_ref, "att-1");
        assert_eq!(msg.attachments[0].size_bytes, 42);
    }

    #[test]
    fn test_inline_attachment_data_is_kept() {
        let msg = normalize_message(message(vec![file_part("tiny.csv", None, Some("YQ"))])).unwrap();
        assert_eq!(msg.attachments[0].content_ref, "inline:YQ");
    }

    #[test]
    fn test_missing_payload_is_an_error() {
        let mut gmail = message(vec![]);
        gmail.payload = None;
        assert!(normalize_message(gmail).is_err());
    }

    #[test]
    fn test_decode_base64() {
        // "Hello, World!" in base64url
        assert_eq!(decode_base64("SGVsbG8sIFdvcmxkIQ"), Some(b"Hello, World!".to_vec()));
        assert_eq!(decode_base64("SGVsbG8sIFdvcmxkIQ=="), Some(b"Hello, World!".to_vec()));
        assert_eq!(decode_base64("***"), None);
    }
}
