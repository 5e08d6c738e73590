//! The backend seam: every way of reaching the mailbox implements `MailBackend`.

use async_trait::async_trait;
use color_eyre::Result;

use super::types::{
  EmailMessage, Label, MailboxStats, MessagePage, OutgoingEmail, TodayStats, UserProfile,
};

/// One execution path to the remote mailbox.
///
/// Backends are stateless with respect to caching; they only perform the
/// call. Backends that need a credential before use override `initialize`.
#[async_trait]
pub trait MailBackend: Send + Sync {
  /// Short name used in logs and errors (e.g., "native", "server")
  fn name(&self) -> &'static str;

  /// Exchange a credential for a ready handle. Must be idempotent.
  async fn initialize(&self, _credential: &str) -> Result<()> {
    Ok(())
  }

  /// List message summaries under `label`.
  async fn list_messages(
    &self,
    label: &str,
    page_size: usize,
    page_token: Option<&str>,
  ) -> Result<MessagePage>;

  /// Fetch a full message.
  async fn get_message(&self, id: &str) -> Result<EmailMessage>;

  /// Send a message and return the new message id.
  async fn send_message(&self, message: &OutgoingEmail) -> Result<String>;

  async fn set_read_state(&self, id: &str, read: bool) -> Result<()>;

  /// Move a message out of the mailbox (to trash).
  async fn delete_message(&self, id: &str) -> Result<()>;

  async fn user_profile(&self) -> Result<UserProfile>;

  async fn labels(&self) -> Result<Vec<Label>>;

  async fn mailbox_stats(&self) -> Result<MailboxStats>;

  async fn today_stats(&self) -> Result<TodayStats>;

  /// Tell the remote side the session is over.
  async fn end_session(&self) -> Result<()> {
    Ok(())
  }
}

/// Source of the access credential handed to the preferred backend.
#[async_trait]
pub trait CredentialSource: Send + Sync {
  async fn access_token(&self) -> Result<String>;
}
