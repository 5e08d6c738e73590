//! Best-effort background prefetch with a fixed-width worker pool.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

use crate::error::MailError;

/// What a prefetch run did. Only used for logging and tests; failures are
/// never surfaced to the caller that triggered the prefetch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchReport {
  pub fetched: usize,
  pub failed: usize,
  pub skipped: usize,
}

/// Spawn `workers` tasks that drain `ids` through `fetch`.
///
/// Returns `None` when there is nothing to do. The returned handle may be
/// dropped; the pool keeps running. Once `cancelled` reports true the
/// remaining ids are skipped.
pub fn spawn_prefetch<F, Fut, C>(
  ids: Vec<String>,
  workers: usize,
  cancelled: C,
  fetch: F,
) -> Option<JoinHandle<PrefetchReport>>
where
  F: Fn(String) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), MailError>> + Send + 'static,
  C: Fn() -> bool + Send + Sync + 'static,
{
  if ids.is_empty() || workers == 0 {
    return None;
  }

  let width = workers.min(ids.len());
  let queue = Arc::new(Mutex::new(VecDeque::from(ids)));
  let fetch = Arc::new(fetch);
  let cancelled = Arc::new(cancelled);

  Some(tokio::spawn(async move {
    let mut pool = JoinSet::new();
    for _ in 0..width {
      let queue = Arc::clone(&queue);
      let fetch = Arc::clone(&fetch);
      let cancelled = Arc::clone(&cancelled);

      pool.spawn(async move {
        let mut report = PrefetchReport::default();
        loop {
          let next = queue.lock().pop_front();
          let Some(id) = next else {
            break;
          };
          if cancelled() {
            report.skipped += 1;
            continue;
          }
          match fetch(id.clone()).await {
            Ok(()) => report.fetched += 1,
            Err(e) => {
              debug!(id = %id, error = %e, "prefetch failed");
              report.failed += 1;
            }
          }
        }
        report
      });
    }

    let mut total = PrefetchReport::default();
    while let Some(joined) = pool.join_next().await {
      if let Ok(report) = joined {
        total.fetched += report.fetched;
        total.failed += report.failed;
        total.skipped += report.skipped;
      }
    }
    debug!(?total, "prefetch finished");
    total
  }))
}
