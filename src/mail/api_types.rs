//! Serde-deserializable types matching Gmail API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::cache::UNREAD;
use super::types::{Attachment, EmailMessage, Label, MailboxStat, UserProfile};

// ============================================================================
// Message list
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMessageList {
  #[serde(default)]
  pub messages: Vec<ApiMessageRef>,
  pub next_page_token: Option<String>,
  #[serde(default)]
  pub result_size_estimate: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMessageRef {
  pub id: String,
  #[serde(default)]
  pub thread_id: String,
}

// ============================================================================
// Message payload
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMessage {
  pub id: String,
  #[serde(default)]
  pub thread_id: String,
  #[serde(default)]
  pub label_ids: Vec<String>,
  #[serde(default)]
  pub snippet: String,
  #[serde(default)]
  pub payload: ApiPart,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPart {
  pub part_id: Option<String>,
  #[serde(default)]
  pub mime_type: String,
  #[serde(default)]
  pub filename: String,
  #[serde(default)]
  pub headers: Vec<ApiHeader>,
  #[serde(default)]
  pub body: ApiBody,
  #[serde(default)]
  pub parts: Vec<ApiPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiBody {
  #[serde(default)]
  pub size: u64,
  pub data: Option<String>,
  pub attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiHeader {
  pub name: String,
  pub value: String,
}

impl ApiPart {
  fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|h| h.name.eq_ignore_ascii_case(name))
      .map(|h| h.value.as_str())
  }
}

/// Extracted display content of a payload tree.
#[derive(Default)]
struct Content {
  html: Option<String>,
  plain: Option<String>,
  attachments: Vec<Attachment>,
  inline_images: Vec<Attachment>,
}

impl Content {
  fn collect(&mut self, part: &ApiPart) {
    if !part.parts.is_empty() {
      for child in &part.parts {
        self.collect(child);
      }
      return;
    }

    if let Some(attachment_id) = &part.body.attachment_id {
      if !part.filename.is_empty() {
        let content_id = part
          .header("Content-ID")
          .map(|v| v.trim_matches(|c: char| c == '<' || c == '>').to_string());
        let attachment = Attachment {
          id: attachment_id.clone(),
          filename: part.filename.clone(),
          mime_type: part.mime_type.clone(),
          size: part.body.size,
          part_id: part.part_id.clone(),
          content_id: content_id.clone(),
        };
        if content_id.is_some() {
          self.inline_images.push(attachment);
        } else {
          self.attachments.push(attachment);
        }
        return;
      }
    }

    let Some(data) = part.body.data.as_deref() else {
      return;
    };
    match part.mime_type.as_str() {
      "text/html" if self.html.is_none() => self.html = decode_body(data),
      "text/plain" if self.plain.is_none() => self.plain = decode_body(data),
      _ => {}
    }
  }
}

/// Decode Gmail's base64url body data, padded or not. Invalid UTF-8 is
/// replaced rather than dropping the body.
pub fn decode_body(data: &str) -> Option<String> {
  let bytes = URL_SAFE_NO_PAD
    .decode(data.trim_end_matches('='))
    .or_else(|_| URL_SAFE.decode(data))
    .ok()?;
  Some(String::from_utf8_lossy(&bytes).into_owned())
}

impl ApiMessage {
  fn header(&self, name: &str) -> String {
    self.payload.header(name).unwrap_or_default().to_string()
  }

  /// Summary without body or attachment details.
  pub fn into_summary(self) -> EmailMessage {
    let has_attachment = has_attachment_parts(&self.payload);
    let mut message = self.into_full();
    message.body.clear();
    message.attachments.clear();
    message.inline_images.clear();
    message.has_attachment = has_attachment;
    message
  }

  /// Full message with the display body (html preferred) and attachments.
  pub fn into_full(self) -> EmailMessage {
    let mut content = Content::default();
    content.collect(&self.payload);

    let from = self.header("From");
    let to = self.header("To");
    let subject = self.header("Subject");
    let date = self.header("Date");
    let unread = self.label_ids.iter().any(|l| l == UNREAD);
    let has_attachment = !content.attachments.is_empty() || !content.inline_images.is_empty();

    EmailMessage {
      id: self.id,
      thread_id: self.thread_id,
      label_ids: self.label_ids,
      from,
      to,
      subject,
      date,
      snippet: self.snippet,
      body: content.html.or(content.plain).unwrap_or_default(),
      unread,
      has_attachment,
      attachments: content.attachments,
      inline_images: content.inline_images,
    }
  }
}

fn has_attachment_parts(part: &ApiPart) -> bool {
  (part.body.attachment_id.is_some() && !part.filename.is_empty())
    || part.parts.iter().any(has_attachment_parts)
}

// ============================================================================
// Mutations
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiModifyRequest {
  pub add_label_ids: Vec<String>,
  pub remove_label_ids: Vec<String>,
}

impl ApiModifyRequest {
  pub fn read_state(read: bool) -> Self {
    let unread = vec![UNREAD.to_string()];
    if read {
      Self {
        add_label_ids: vec![],
        remove_label_ids: unread,
      }
    } else {
      Self {
        add_label_ids: unread,
        remove_label_ids: vec![],
      }
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ApiSendRequest {
  pub raw: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiSendResponse {
  pub id: String,
}

// ============================================================================
// Labels and profile
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiLabelList {
  #[serde(default)]
  pub labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLabel {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub messages_total: u64,
  #[serde(default)]
  pub messages_unread: u64,
}

impl From<ApiLabel> for MailboxStat {
  fn from(label: ApiLabel) -> Self {
    Self {
      id: label.id,
      name: label.name,
      total: label.messages_total,
      unread: label.messages_unread,
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProfile {
  pub email_address: String,
}

impl From<ApiProfile> for UserProfile {
  fn from(profile: ApiProfile) -> Self {
    Self {
      email: profile.email_address,
      name: None,
      picture: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn encode(text: &str) -> String {
    URL_SAFE_NO_PAD.encode(text)
  }

  fn multipart_message() -> ApiMessage {
    serde_json::from_value(json!({
      "id": "m1",
      "threadId": "t1",
      "labelIds": ["INBOX", "UNREAD"],
      "snippet": "Hello there",
      "payload": {
        "mimeType": "multipart/mixed",
        "headers": [
          {"name": "From", "value": "alice@example.com"},
          {"name": "to", "value": "bob@example.com"},
          {"name": "Subject", "value": "Lunch?"},
          {"name": "Date", "value": "Mon, 1 Jan 2024 12:00:00 +0000"}
        ],
        "parts": [
          {
            "mimeType": "multipart/alternative",
            "parts": [
              {"mimeType": "text/plain", "body": {"size": 5, "data": encode("plain")}},
              {"mimeType": "text/html", "body": {"size": 11, "data": encode("<b>html</b>")}}
            ]
          },
          {
            "partId": "2",
            "mimeType": "application/pdf",
            "filename": "menu.pdf",
            "body": {"size": 1024, "attachmentId": "att-1"}
          },
          {
            "partId": "3",
            "mimeType": "image/png",
            "filename": "logo.png",
            "headers": [{"name": "Content-ID", "value": "<logo@x>"}],
            "body": {"size": 64, "attachmentId": "att-2"}
          }
        ]
      }
    }))
    .unwrap()
  }

  #[test]
  fn test_full_message_prefers_html_and_splits_attachments() {
    let msg = multipart_message().into_full();

    assert_eq!(msg.from, "alice@example.com");
    assert_eq!(msg.to, "bob@example.com");
    assert_eq!(msg.subject, "Lunch?");
    assert_eq!(msg.body, "<b>html</b>");
    assert!(msg.unread);
    assert!(msg.has_attachment);
    assert_eq!(msg.attachments.len(), 1);
    assert_eq!(msg.attachments[0].filename, "menu.pdf");
    assert_eq!(msg.inline_images.len(), 1);
    assert_eq!(msg.inline_images[0].content_id.as_deref(), Some("logo@x"));
  }

  #[test]
  fn test_summary_drops_body_but_keeps_attachment_flag() {
    let msg = multipart_message().into_summary();
    assert!(msg.body.is_empty());
    assert!(msg.attachments.is_empty());
    assert!(msg.has_attachment);
    assert_eq!(msg.snippet, "Hello there");
  }

  #[test]
  fn test_single_part_plain_body() {
    let msg: ApiMessage = serde_json::from_value(json!({
      "id": "m2",
      "payload": {"mimeType": "text/plain", "body": {"data": encode("just text")}}
    }))
    .unwrap();
    let msg = msg.into_full();
    assert_eq!(msg.body, "just text");
    assert!(!msg.unread);
    assert!(!msg.has_attachment);
  }

  #[test]
  fn test_decode_body_accepts_padding() {
    assert_eq!(decode_body("SGVsbG8gV29ybGQh").as_deref(), Some("Hello World!"));
    assert_eq!(decode_body("aGk=").as_deref(), Some("hi"));
    assert_eq!(decode_body("@@@"), None);
  }

  #[test]
  fn test_decode_body_keeps_invalid_utf8_text() {
    let data = URL_SAFE_NO_PAD.encode(b"caf\xe9 ok");
    assert_eq!(decode_body(&data).as_deref(), Some("caf\u{fffd} ok"));
  }

  #[test]
  fn test_label_list() {
    let list: ApiLabelList = serde_json::from_value(json!({
      "labels": [
        {"id": "INBOX", "name": "INBOX", "type": "system", "messageListVisibility": "hide"},
        {"id": "Label_7", "name": "Receipts", "type": "user"}
      ]
    }))
    .unwrap();
    assert_eq!(list.labels.len(), 2);
    assert_eq!(list.labels[1].name, "Receipts");
    assert_eq!(list.labels[1].label_type, "user");

    let empty: ApiLabelList = serde_json::from_value(json!({})).unwrap();
    assert!(empty.labels.is_empty());
  }

  #[test]
  fn test_modify_request_for_read_state() {
    let read = serde_json::to_value(ApiModifyRequest::read_state(true)).unwrap();
    assert_eq!(read, json!({"addLabelIds": [], "removeLabelIds": ["UNREAD"]}));
    let unread = serde_json::to_value(ApiModifyRequest::read_state(false)).unwrap();
    assert_eq!(unread, json!({"addLabelIds": ["UNREAD"], "removeLabelIds": []}));
  }
}
