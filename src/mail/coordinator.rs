//! Mail coordinator: cache-aware, deduplicated access to the mailbox through
//! a preferred backend with a secondary fallback.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLayer, CacheResult, FlightToken, InFlight};
use crate::error::{MailError, Result};

use super::backend::{CredentialSource, MailBackend};
use super::cache::TOUCHED_BY_SEND;
use super::prefetch::spawn_prefetch;
use super::types::{
  EmailMessage, Label, MailboxStats, MessagePage, OutgoingEmail, SendReceipt, TodayStats, UserProfile,
};

const INIT_KEY: &str = "init:native";

/// Readiness of the preferred backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
  Uninitialized,
  Initializing,
  Ready,
  /// Initialization failed; only logout leaves this state.
  Unusable,
}

/// Tunables for a coordinator. TTLs are configuration, not constants.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
  pub collection_ttl: Duration,
  pub item_ttl: Duration,
  /// Width of the prefetch worker pool; 0 disables prefetch
  pub prefetch_workers: usize,
  /// How many bodies of a first page to prefetch
  pub prefetch_count: usize,
}

impl Default for CoordinatorOptions {
  fn default() -> Self {
    Self {
      collection_ttl: Duration::from_secs(30),
      item_ttl: Duration::from_secs(300),
      prefetch_workers: 3,
      prefetch_count: 5,
    }
  }
}

struct Inner {
  /// None when the native backend is disabled
  preferred: Option<Arc<dyn MailBackend>>,
  secondary: Arc<dyn MailBackend>,
  credentials: Arc<dyn CredentialSource>,
  cache: CacheLayer<EmailMessage>,
  readiness: Mutex<Readiness>,
  init: InFlight<()>,
  /// Bumped on every reset so background work from an old session stops
  session: AtomicU64,
  options: CoordinatorOptions,
}

/// One per authenticated session. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MailCoordinator {
  inner: Arc<Inner>,
}

impl MailCoordinator {
  pub fn new(
    preferred: Option<Arc<dyn MailBackend>>,
    secondary: Arc<dyn MailBackend>,
    credentials: Arc<dyn CredentialSource>,
    options: CoordinatorOptions,
  ) -> Self {
    let cache = CacheLayer::new(options.collection_ttl, options.item_ttl);
    Self {
      inner: Arc::new(Inner {
        preferred,
        secondary,
        credentials,
        cache,
        readiness: Mutex::new(Readiness::Uninitialized),
        init: InFlight::new(),
        session: AtomicU64::new(0),
        options,
      }),
    }
  }

  pub fn readiness(&self) -> Readiness {
    *self.inner.readiness.lock()
  }

  pub fn options(&self) -> &CoordinatorOptions {
    &self.inner.options
  }

  /// A page of summaries for `label`. Fresh first pages come from cache.
  pub async fn fetch_collection(
    &self,
    label: &str,
    page_size: usize,
    page_token: Option<&str>,
  ) -> Result<CacheResult<MessagePage>> {
    let inner = Arc::clone(&self.inner);
    let owned_label = label.to_string();
    let owned_token = page_token.map(String::from);

    let result = self
      .inner
      .cache
      .fetch_page(label, page_size, page_token, move || async move {
        inner
          .with_fallback("list_messages", move |backend| {
            let label = owned_label.clone();
            let token = owned_token.clone();
            async move { backend.list_messages(&label, page_size, token.as_deref()).await }.boxed()
          })
          .await
      })
      .await?;

    if page_token.is_none() {
      let ids = result
        .data
        .items
        .iter()
        .take(self.inner.options.prefetch_count)
        .map(|m| m.id.clone())
        .collect();
      self.prefetch(ids);
    }
    Ok(result)
  }

  /// A full message. Cached bodies are served without a backend call.
  pub async fn fetch_item(&self, id: &str) -> Result<CacheResult<EmailMessage>> {
    let inner = Arc::clone(&self.inner);
    let owned_id = id.to_string();

    self
      .inner
      .cache
      .fetch_one(id, move || async move {
        inner
          .with_fallback("get_message", move |backend| {
            let id = owned_id.clone();
            async move { backend.get_message(&id).await }.boxed()
          })
          .await
      })
      .await
  }

  /// Send a message, then invalidate the collections a new message lands in.
  pub async fn send_item(&self, message: OutgoingEmail) -> Result<SendReceipt> {
    if message.to.trim().is_empty() {
      return Err(MailError::InvalidMessage("missing recipient".into()));
    }
    if message.body.is_empty() {
      return Err(MailError::InvalidMessage("missing body".into()));
    }

    let message = Arc::new(message);
    let id = self
      .inner
      .with_fallback("send_message", move |backend| {
        let message = Arc::clone(&message);
        async move { backend.send_message(&message).await }.boxed()
      })
      .await?;

    for label in TOUCHED_BY_SEND {
      self.inner.cache.invalidate(label);
    }
    info!(id = %id, "message sent");
    Ok(SendReceipt { success: true, id })
  }

  /// Mark a message read or unread and patch every cached copy in place.
  pub async fn mutate_read_state(&self, id: &str, read: bool) -> Result<()> {
    let owned_id = id.to_string();
    self
      .inner
      .with_fallback("set_read_state", move |backend| {
        let id = owned_id.clone();
        async move { backend.set_read_state(&id, read).await }.boxed()
      })
      .await?;

    let patched = self.inner.cache.patch(id, |m| m.set_read(read));
    debug!(id, read, patched, "read state updated");
    Ok(())
  }

  /// Delete a message and drop it from every cache table.
  pub async fn delete_item(&self, id: &str) -> Result<()> {
    let owned_id = id.to_string();
    self
      .inner
      .with_fallback("delete_message", move |backend| {
        let id = owned_id.clone();
        async move { backend.delete_message(&id).await }.boxed()
      })
      .await?;

    let removed = self.inner.cache.remove(id);
    debug!(id, removed, "message deleted");
    Ok(())
  }

  /// Drop the cached collection for `label` so the next fetch revalidates.
  pub fn invalidate_collection(&self, label: &str) -> bool {
    self.inner.cache.invalidate(label)
  }

  /// Force a revalidating fetch of the first page of `label`.
  pub async fn refresh(&self, label: &str, page_size: usize) -> Result<CacheResult<MessagePage>> {
    self.invalidate_collection(label);
    self.fetch_collection(label, page_size, None).await
  }

  pub async fn user_profile(&self) -> Result<UserProfile> {
    self
      .inner
      .with_fallback("user_profile", |backend| {
        async move { backend.user_profile().await }.boxed()
      })
      .await
  }

  pub async fn labels(&self) -> Result<Vec<Label>> {
    self
      .inner
      .with_fallback("labels", |backend| async move { backend.labels().await }.boxed())
      .await
  }

  pub async fn mailbox_stats(&self) -> Result<MailboxStats> {
    self
      .inner
      .with_fallback("mailbox_stats", |backend| {
        async move { backend.mailbox_stats().await }.boxed()
      })
      .await
  }

  pub async fn today_stats(&self) -> Result<TodayStats> {
    self
      .inner
      .with_fallback("today_stats", |backend| {
        async move { backend.today_stats().await }.boxed()
      })
      .await
  }

  /// Reset local state, then end the session on the server.
  ///
  /// Local state is always reset, even when the server call fails.
  pub async fn logout(&self) -> Result<()> {
    self.reset();
    let secondary = &self.inner.secondary;
    secondary
      .end_session()
      .await
      .map_err(|e| MailError::operation(secondary.name(), "end_session", e))
  }

  /// Reset local state without contacting the server.
  pub fn dispose(&self) {
    self.reset();
  }

  fn reset(&self) {
    {
      let mut readiness = self.inner.readiness.lock();
      self.inner.init.supersede_all();
      *readiness = Readiness::Uninitialized;
    }
    self.inner.session.fetch_add(1, Ordering::AcqRel);
    self.inner.cache.clear();
    info!("session state cleared");
  }

  fn prefetch(&self, ids: Vec<String>) {
    let session = self.inner.session.load(Ordering::Acquire);
    let watcher = Arc::clone(&self.inner);
    let coordinator = self.clone();

    spawn_prefetch(
      ids,
      self.inner.options.prefetch_workers,
      move || watcher.session.load(Ordering::Acquire) != session,
      move |id| {
        let coordinator = coordinator.clone();
        async move { coordinator.fetch_item(&id).await.map(|_| ()) }
      },
    );
  }

  /// Cached members of `label`, ignoring freshness.
  pub fn cached_collection(&self, label: &str) -> Option<Vec<EmailMessage>> {
    self.inner.cache.collection_snapshot(label)
  }

  /// Cached body of `id`, if present and not expired.
  pub fn cached_item(&self, id: &str) -> Option<EmailMessage> {
    self.inner.cache.item_snapshot(id)
  }

  /// Number of requests currently in flight (lists and items).
  pub fn in_flight(&self) -> usize {
    self.inner.cache.in_flight_count()
  }
}

impl Inner {
  /// The preferred backend, if it is usable. Initializes it lazily; every
  /// concurrent caller shares one initialization.
  async fn ensure_preferred(self: &Arc<Self>) -> Option<Arc<dyn MailBackend>> {
    let preferred = self.preferred.as_ref()?;

    let state = *self.readiness.lock();
    match state {
      Readiness::Ready => return Some(Arc::clone(preferred)),
      Readiness::Unusable => return None,
      Readiness::Uninitialized | Readiness::Initializing => {}
    }

    let inner = Arc::clone(self);
    let (request, _) = self
      .init
      .join_or_start(INIT_KEY, move |token| async move { inner.initialize_preferred(token).await });

    match request.await {
      Ok(()) if *self.readiness.lock() == Readiness::Ready => Some(Arc::clone(preferred)),
      Ok(()) => None,
      Err(e) => {
        debug!(error = %e, "preferred backend unavailable");
        None
      }
    }
  }

  async fn initialize_preferred(&self, token: FlightToken) -> Result<()> {
    let Some(preferred) = self.preferred.as_ref() else {
      return Ok(());
    };

    {
      let mut readiness = self.readiness.lock();
      if token.is_superseded() {
        return Ok(());
      }
      *readiness = Readiness::Initializing;
    }
    info!(backend = preferred.name(), "initializing preferred backend");

    let outcome = match self.credentials.access_token().await {
      Ok(credential) => preferred.initialize(&credential).await,
      Err(e) => Err(e),
    };

    let mut readiness = self.readiness.lock();
    if token.is_superseded() {
      debug!("initialization finished after reset, ignoring");
      return Ok(());
    }
    match outcome {
      Ok(()) => {
        *readiness = Readiness::Ready;
        info!(backend = preferred.name(), "preferred backend ready");
        Ok(())
      }
      Err(e) => {
        *readiness = Readiness::Unusable;
        warn!(backend = preferred.name(), error = %e, "preferred backend initialization failed");
        Err(MailError::Initialization(Arc::new(e)))
      }
    }
  }

  /// Run `call` on the preferred backend, falling back to the secondary.
  ///
  /// Initialization failure disables the preferred backend for the session;
  /// a failed call only affects this operation.
  async fn with_fallback<T, F>(self: &Arc<Self>, operation: &'static str, call: F) -> Result<T>
  where
    T: Send,
    F: Fn(Arc<dyn MailBackend>) -> BoxFuture<'static, color_eyre::Result<T>> + Send + Sync,
  {
    let mut preferred_failure = None;

    if let Some(preferred) = self.ensure_preferred().await {
      match call(Arc::clone(&preferred)).await {
        Ok(value) => return Ok(value),
        Err(e) => {
          warn!(
            operation,
            backend = preferred.name(),
            fallback = self.secondary.name(),
            error = %e,
            "preferred backend failed, falling back"
          );
          preferred_failure = Some(Arc::new(e));
        }
      }
    }

    match call(Arc::clone(&self.secondary)).await {
      Ok(value) => Ok(value),
      Err(e) => {
        error!(operation, backend = self.secondary.name(), error = %e, "all backends failed");
        Err(MailError::AllBackendsFailed {
          operation,
          preferred: preferred_failure,
          secondary: Arc::new(e),
        })
      }
    }
  }
}
