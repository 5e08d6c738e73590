//! Caching implementations and well-known collection keys for mail types.

use crate::cache::Cacheable;

use super::types::EmailMessage;

pub const INBOX: &str = "INBOX";
pub const SENT: &str = "SENT";
pub const UNREAD: &str = "UNREAD";

/// Collections whose cached contents go stale when a message is sent.
pub const TOUCHED_BY_SEND: &[&str] = &[SENT, INBOX];

/// Labels queried for mailbox stats.
pub const STATS_LABELS: &[&str] = &[
  "INBOX",
  "SENT",
  "DRAFT",
  "STARRED",
  "TRASH",
  "SPAM",
  "CATEGORY_SOCIAL",
  "CATEGORY_PROMOTIONS",
];

impl Cacheable for EmailMessage {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "message"
  }
}

impl EmailMessage {
  /// Flip the read state, keeping the `UNREAD` label in step.
  pub fn set_read(&mut self, read: bool) {
    self.unread = !read;
    let has_label = self.label_ids.iter().any(|l| l == UNREAD);
    if read && has_label {
      self.label_ids.retain(|l| l != UNREAD);
    } else if !read && !has_label {
      self.label_ids.push(UNREAD.to_string());
    }
  }
}
