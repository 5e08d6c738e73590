//! Keyed async query with stale-result suppression.
//!
//! A `Query<T>` fetches data for one key at a time. Fetching a new key makes
//! it the active key; results that arrive later for any other key are
//! dropped instead of replacing the state. The network call itself is not
//! cancelled.
//!
//! # Example
//!
//! ```ignore
//! let mut inbox = collection_query(coordinator.clone(), 20);
//!
//! inbox.fetch("INBOX");
//! inbox.fetch("SENT"); // an INBOX page arriving now is discarded
//!
//! // In event loop tick
//! if inbox.poll() {
//!     // State changed, trigger re-render
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::MailError;
use crate::mail::{MailCoordinator, MessagePage};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data for the active key
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(MailError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&MailError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, MailError>> + Send>>;

type FetcherFn<T> = Box<dyn Fn(String) -> BoxFuture<T> + Send + Sync>;

/// A result tagged with the key it was fetched for and the fetch generation.
struct Delivery<T> {
  key: String,
  generation: u64,
  result: Result<T, MailError>,
}

/// Keyed async query.
///
/// Every fetch runs on its own task and reports back through one channel.
/// Only the delivery for the most recent fetch is applied; everything else
/// is counted and dropped.
pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  sender: mpsc::UnboundedSender<Delivery<T>>,
  receiver: mpsc::UnboundedReceiver<Delivery<T>>,
  active_key: Option<String>,
  generation: u64,
  discarded: usize,
  fetched_at: Option<Instant>,
  stale_time: Duration,
}

impl<T: Send + 'static> Query<T> {
  /// Create a new query. `fetcher` is called with the key on every fetch.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, MailError>> + Send + 'static,
  {
    let (sender, receiver) = mpsc::unbounded_channel();
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move |key| Box::pin(fetcher(key))),
      sender,
      receiver,
      active_key: None,
      generation: 0,
      discarded: 0,
      fetched_at: None,
      stale_time: Duration::from_secs(30),
    }
  }

  /// Set the stale time for this query.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn error(&self) -> Option<&MailError> {
    self.state.error()
  }

  /// The key whose results are currently accepted.
  pub fn active_key(&self) -> Option<&str> {
    self.active_key.as_deref()
  }

  /// How many late results have been dropped so far.
  pub fn discarded(&self) -> usize {
    self.discarded
  }

  /// Check if the data is stale (older than stale_time).
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| t.elapsed() > self.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Fetch `key`, making it the active key.
  ///
  /// A no-op if `key` is already active and loading.
  pub fn fetch(&mut self, key: &str) {
    if self.state.is_loading() && self.active_key.as_deref() == Some(key) {
      return;
    }
    self.start_fetch(key);
  }

  /// Fetch the active key again, even if it is loading.
  pub fn refetch(&mut self) {
    if let Some(key) = self.active_key.clone() {
      self.start_fetch(&key);
    }
  }

  /// Apply any results that have arrived without waiting.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok(delivery) = self.receiver.try_recv() {
      changed |= self.apply(delivery);
    }
    changed
  }

  /// Wait until the active fetch settles and return the new state.
  pub async fn settle(&mut self) -> &QueryState<T> {
    while self.state.is_loading() {
      // The query holds a sender, so the channel never closes.
      let Some(delivery) = self.receiver.recv().await else {
        break;
      };
      self.apply(delivery);
    }
    &self.state
  }

  fn apply(&mut self, delivery: Delivery<T>) -> bool {
    let current = self.active_key.as_deref() == Some(delivery.key.as_str())
      && delivery.generation == self.generation;
    if !current {
      debug!(key = %delivery.key, active = ?self.active_key, "discarding stale result");
      self.discarded += 1;
      return false;
    }

    match delivery.result {
      Ok(data) => {
        self.state = QueryState::Success(data);
        self.fetched_at = Some(Instant::now());
      }
      Err(e) => self.state = QueryState::Error(e),
    }
    true
  }

  fn start_fetch(&mut self, key: &str) {
    self.generation += 1;
    self.active_key = Some(key.to_string());
    self.state = QueryState::Loading;

    let delivery_key = key.to_string();
    let generation = self.generation;
    let sender = self.sender.clone();
    let future = (self.fetcher)(key.to_string());
    tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - the query may have been dropped
      let _ = sender.send(Delivery {
        key: delivery_key,
        generation,
        result,
      });
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("active_key", &self.active_key)
      .field("generation", &self.generation)
      .field("fetched_at", &self.fetched_at)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}

/// First pages of a label, keyed by label.
pub type CollectionQuery = Query<MessagePage>;

/// A collection query reading through `coordinator`.
pub fn collection_query(coordinator: MailCoordinator, page_size: usize) -> CollectionQuery {
  let stale_time = coordinator.options().collection_ttl;
  Query::new(move |label: String| {
    let coordinator = coordinator.clone();
    async move {
      coordinator
        .fetch_collection(&label, page_size, None)
        .await
        .map(|result| result.into_data())
    }
  })
  .with_stale_time(stale_time)
}
