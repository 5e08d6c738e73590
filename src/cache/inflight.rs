//! Request coalescing: at most one running request per key.
//!
//! A request is started on the tokio runtime and its `Shared` handle is
//! stored under its key. Later callers with the same key get a clone of the
//! handle instead of starting a second request. The task that drives the
//! request owns a guard that removes the entry when the task ends, whether
//! the request succeeded, failed, panicked or was aborted.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::MailError;

/// Handle to a coalesced request. Every clone resolves to the same value.
pub type SharedRequest<T> = Shared<BoxFuture<'static, Result<T, MailError>>>;

struct Flight<T> {
  id: u64,
  request: SharedRequest<T>,
  superseded: Arc<AtomicBool>,
}

struct FlightTable<T> {
  entries: HashMap<String, Flight<T>>,
  next_id: u64,
}

/// Given to a request body so it can tell whether it was superseded
/// (by invalidation or logout) while it was running.
#[derive(Debug, Clone)]
pub struct FlightToken {
  superseded: Arc<AtomicBool>,
}

impl FlightToken {
  pub fn is_superseded(&self) -> bool {
    self.superseded.load(Ordering::Acquire)
  }
}

/// Removes the flight entry when the driving task ends.
struct FlightGuard<T> {
  table: Arc<Mutex<FlightTable<T>>>,
  key: String,
  id: u64,
}

impl<T> Drop for FlightGuard<T> {
  fn drop(&mut self) {
    let mut table = self.table.lock();
    // Only remove our own entry; a newer flight may own the key by now.
    if table.entries.get(&self.key).map(|f| f.id) == Some(self.id) {
      table.entries.remove(&self.key);
    }
  }
}

/// Table of in-flight requests producing `T`.
pub struct InFlight<T> {
  table: Arc<Mutex<FlightTable<T>>>,
}

impl<T> Clone for InFlight<T> {
  fn clone(&self) -> Self {
    Self {
      table: Arc::clone(&self.table),
    }
  }
}

impl<T> Default for InFlight<T> {
  fn default() -> Self {
    Self {
      table: Arc::new(Mutex::new(FlightTable {
        entries: HashMap::new(),
        next_id: 0,
      })),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> InFlight<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Join the request running under `key`, or start one built by `start`.
  ///
  /// `start` is always called, but the future it returns is only driven when
  /// this call is the one that starts the request. It must therefore be lazy
  /// (an `async` block or `async fn` call).
  ///
  /// Returns the shared request and whether an existing one was joined.
  pub fn join_or_start<F, Fut>(&self, key: &str, start: F) -> (SharedRequest<T>, bool)
  where
    F: FnOnce(FlightToken) -> Fut,
    Fut: Future<Output = Result<T, MailError>> + Send + 'static,
  {
    let superseded = Arc::new(AtomicBool::new(false));
    let body = start(FlightToken {
      superseded: Arc::clone(&superseded),
    });

    let mut table = self.table.lock();
    if let Some(flight) = table.entries.get(key) {
      debug!(key, "joining in-flight request");
      return (flight.request.clone(), true);
    }

    let id = table.next_id;
    table.next_id += 1;

    let guard = FlightGuard {
      table: Arc::clone(&self.table),
      key: key.to_string(),
      id,
    };
    let handle = tokio::spawn(async move {
      let _guard = guard;
      body.await
    });

    let label = key.to_string();
    let request = async move {
      match handle.await {
        Ok(result) => result,
        Err(e) => Err(MailError::Interrupted(format!("{}: {}", label, e))),
      }
    }
    .boxed()
    .shared();

    table.entries.insert(
      key.to_string(),
      Flight {
        id,
        request: request.clone(),
        superseded,
      },
    );
    (request, false)
  }

  /// Forget the request under `key`. It keeps running for its current
  /// waiters, but its token reports superseded and new callers start fresh.
  pub fn supersede(&self, key: &str) -> bool {
    let mut table = self.table.lock();
    match table.entries.remove(key) {
      Some(flight) => {
        flight.superseded.store(true, Ordering::Release);
        true
      }
      None => false,
    }
  }

  /// Supersede every request whose key starts with `prefix`.
  pub fn supersede_prefix(&self, prefix: &str) -> usize {
    let mut table = self.table.lock();
    let keys: Vec<String> = table
      .entries
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    for key in &keys {
      if let Some(flight) = table.entries.remove(key) {
        flight.superseded.store(true, Ordering::Release);
      }
    }
    keys.len()
  }

  pub fn supersede_all(&self) {
    let mut table = self.table.lock();
    for (_, flight) in table.entries.drain() {
      flight.superseded.store(true, Ordering::Release);
    }
  }

  pub fn contains(&self, key: &str) -> bool {
    self.table.lock().entries.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.table.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::Notify;

  #[tokio::test]
  async fn test_concurrent_callers_share_one_request() {
    let flights: InFlight<u32> = InFlight::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let start = |calls: Arc<AtomicUsize>, gate: Arc<Notify>| {
      move |_token: FlightToken| async move {
        calls.fetch_add(1, Ordering::SeqCst);
        gate.notified().await;
        Ok(7)
      }
    };

    let (first, joined_first) =
      flights.join_or_start("item:1", start(calls.clone(), gate.clone()));
    let (second, joined_second) =
      flights.join_or_start("item:1", start(calls.clone(), gate.clone()));
    assert!(!joined_first);
    assert!(joined_second);
    assert!(flights.contains("item:1"));

    tokio::task::yield_now().await;
    gate.notify_one();

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), 7);
    assert_eq!(b.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(flights.is_empty());
  }

  #[tokio::test]
  async fn test_entry_removed_after_failure() {
    let flights: InFlight<u32> = InFlight::new();
    let (request, _) = flights.join_or_start("list:INBOX:first", |_| async {
      Err(MailError::operation("server", "list_messages", eyre!("503")))
    });

    assert!(request.await.is_err());
    assert!(!flights.contains("list:INBOX:first"));
  }

  #[tokio::test]
  async fn test_entry_removed_after_panic() {
    let flights: InFlight<u32> = InFlight::new();
    let (request, _) = flights.join_or_start("item:boom", |_| async {
      if true {
        panic!("backend exploded");
      }
      Ok(1)
    });

    match request.await {
      Err(MailError::Interrupted(key)) => assert!(key.starts_with("item:boom")),
      other => panic!("unexpected result: {other:?}"),
    }
    assert!(flights.is_empty());
  }

  #[tokio::test]
  async fn test_supersede_flags_token_and_allows_restart() {
    let flights: InFlight<u32> = InFlight::new();
    let gate = Arc::new(Notify::new());
    let observed = Arc::new(AtomicBool::new(false));

    let (old, _) = {
      let gate = gate.clone();
      let observed = observed.clone();
      flights.join_or_start("list:SENT:first", move |token| async move {
        gate.notified().await;
        observed.store(token.is_superseded(), Ordering::SeqCst);
        Ok(1)
      })
    };

    assert_eq!(flights.supersede_prefix("list:SENT:"), 1);
    let (fresh, joined) = flights.join_or_start("list:SENT:first", |_| async { Ok(2) });
    assert!(!joined);

    gate.notify_one();
    assert_eq!(old.await.unwrap(), 1);
    assert_eq!(fresh.await.unwrap(), 2);
    assert!(observed.load(Ordering::SeqCst));
    assert!(flights.is_empty());
  }
}
