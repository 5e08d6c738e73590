//! Mailbox access: domain types, the two backends and the coordinator that
//! puts the cache in front of them.

pub mod api_types;
pub mod backend;
pub mod cache;
pub mod coordinator;
pub mod gmail;
pub mod prefetch;
pub mod server;
pub mod types;

pub use backend::{CredentialSource, MailBackend};
pub use coordinator::{CoordinatorOptions, MailCoordinator, Readiness};
pub use gmail::GmailBackend;
pub use server::{ServerBackend, ServerClient, ServerCredentials, StaticCredential};
pub use types::{
  Attachment, EmailMessage, Label, MailboxStat, MailboxStats, MessagePage, OutgoingEmail, SendReceipt,
  TodayStats, UserProfile,
};
