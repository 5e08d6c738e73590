use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cache::Page;

/// A message. List endpoints return these with an empty body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
  pub id: String,
  #[serde(default)]
  pub thread_id: String,
  #[serde(default)]
  pub label_ids: Vec<String>,
  #[serde(default)]
  pub from: String,
  #[serde(default)]
  pub to: String,
  #[serde(default)]
  pub subject: String,
  #[serde(default)]
  pub date: String,
  #[serde(default)]
  pub snippet: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub unread: bool,
  #[serde(default)]
  pub has_attachment: bool,
  #[serde(default)]
  pub attachments: Vec<Attachment>,
  #[serde(default)]
  pub inline_images: Vec<Attachment>,
}

/// Attachment metadata (content is not fetched)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
  #[serde(default)]
  pub id: String,
  pub filename: String,
  pub mime_type: String,
  #[serde(default)]
  pub size: u64,
  #[serde(default)]
  pub part_id: Option<String>,
  #[serde(default)]
  pub content_id: Option<String>,
}

/// A message to be sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEmail {
  pub to: String,
  pub subject: String,
  pub body: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cc: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bcc: Option<String>,
}

impl OutgoingEmail {
  pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
    Self {
      to: to.into(),
      subject: subject.into(),
      body: body.into(),
      cc: None,
      bcc: None,
    }
  }
}

/// Outcome of a successful send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
  pub success: bool,
  pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub email: String,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub picture: Option<String>,
}

/// A label as listed by the mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
  pub id: String,
  pub name: String,
  /// "system" or "user"
  #[serde(rename = "type", default)]
  pub label_type: String,
}

/// Message counts for one label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStat {
  pub id: String,
  pub name: String,
  pub total: u64,
  pub unread: u64,
}

/// Label id -> counts
pub type MailboxStats = BTreeMap<String, MailboxStat>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayStats {
  pub total_today: u64,
  pub unread_today: u64,
}

/// A page of message summaries
pub type MessagePage = Page<EmailMessage>;
