//! Error types surfaced by the mail coordinator.
//!
//! Backends report failures as `color_eyre::Report`. The coordinator wraps
//! them in `Arc` so a single failure can be handed to every caller that was
//! coalesced onto the same in-flight request.

use color_eyre::Report;
use std::sync::Arc;
use thiserror::Error;

/// Shared, cloneable backend failure.
pub type BackendFailure = Arc<Report>;

#[derive(Debug, Clone, Error)]
pub enum MailError {
  /// The preferred backend could not be brought up. Sticky until logout.
  #[error("native backend initialization failed: {0}")]
  Initialization(BackendFailure),

  /// A single backend call failed.
  #[error("{operation} failed on {backend} backend: {error}")]
  Operation {
    backend: &'static str,
    operation: &'static str,
    error: BackendFailure,
  },

  /// Every backend that was tried failed.
  #[error("{operation} failed on all backends: {secondary}")]
  AllBackendsFailed {
    operation: &'static str,
    preferred: Option<BackendFailure>,
    secondary: BackendFailure,
  },

  #[error("invalid message: {0}")]
  InvalidMessage(String),

  /// The task driving a shared request did not run to completion.
  #[error("request {0} was interrupted")]
  Interrupted(String),
}

impl MailError {
  pub fn operation(backend: &'static str, operation: &'static str, error: Report) -> Self {
    Self::Operation {
      backend,
      operation,
      error: Arc::new(error),
    }
  }

  /// True if this error came out of the fallback path with both backends failing.
  pub fn is_total_failure(&self) -> bool {
    matches!(self, Self::AllBackendsFailed { .. })
  }
}

pub type Result<T, E = MailError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[test]
  fn test_operation_error_display() {
    let err = MailError::operation("native", "get_message", eyre!("boom"));
    assert_eq!(err.to_string(), "get_message failed on native backend: boom");
    assert!(!err.is_total_failure());
  }

  #[test]
  fn test_all_backends_failed_keeps_both_causes() {
    let err = MailError::AllBackendsFailed {
      operation: "send_message",
      preferred: Some(Arc::new(eyre!("token expired"))),
      secondary: Arc::new(eyre!("connection refused")),
    };
    assert!(err.is_total_failure());
    assert_eq!(
      err.to_string(),
      "send_message failed on all backends: connection refused"
    );

    let cloned = err.clone();
    match cloned {
      MailError::AllBackendsFailed { preferred, .. } => {
        assert_eq!(preferred.map(|e| e.to_string()).as_deref(), Some("token expired"));
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }
}
