//! Cache layer that orchestrates caching logic with backend fetching.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::inflight::InFlight;
use super::storage::MemoryStorage;
use super::traits::{CacheResult, Cacheable, Page};
use crate::error::MailError;

/// Dedup key for a page of a collection.
pub fn list_request_key(collection: &str, page_token: Option<&str>) -> String {
  format!("list:{}:{}", collection, page_token.unwrap_or("first"))
}

/// Dedup key for a single item.
pub fn item_request_key(id: &str) -> String {
  format!("item:{}", id)
}

/// Cache layer that manages caching logic and request coalescing.
///
/// This layer sits between the coordinator and the backends. It owns the
/// collection table, the item table and the two in-flight tables, and is
/// the only thing that mutates them.
pub struct CacheLayer<T: Cacheable> {
  storage: Arc<Mutex<MemoryStorage<T>>>,
  lists: InFlight<Page<T>>,
  items: InFlight<T>,
  /// How long a cached first page may be served without revalidation
  collection_ttl: Duration,
  /// How long a fetched item stays in the item table
  item_ttl: Duration,
}

impl<T: Cacheable> CacheLayer<T> {
  pub fn new(collection_ttl: Duration, item_ttl: Duration) -> Self {
    Self {
      storage: Arc::new(Mutex::new(MemoryStorage::new())),
      lists: InFlight::new(),
      items: InFlight::new(),
      collection_ttl,
      item_ttl,
    }
  }

  /// Serve the first `page_size` members of a fresh cached collection.
  pub fn cached_page(&self, collection: &str, page_size: usize) -> Option<CacheResult<Page<T>>> {
    let storage = self.storage.lock();
    let cached = storage.get_collection(collection, self.collection_ttl)?;
    let items = cached.items.iter().take(page_size).cloned().collect();
    Some(CacheResult::from_cache(
      Page::new(items, cached.next_page_token.clone()),
      cached.fetched_at,
    ))
  }

  /// Fetch a page with cache-first strategy.
  ///
  /// 1. First page with a fresh cache entry: return it, no fetch
  /// 2. Otherwise join the in-flight request for the same page, if any
  /// 3. Otherwise run `fetcher`; first pages overwrite the cached collection
  ///
  /// Only first pages are cached. A request superseded while running (by
  /// invalidation, a patch or removal, or `clear`) still resolves for its
  /// waiters but is not cached.
  pub async fn fetch_page<F, Fut>(
    &self,
    collection: &str,
    page_size: usize,
    page_token: Option<&str>,
    fetcher: F,
  ) -> Result<CacheResult<Page<T>>, MailError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Page<T>, MailError>> + Send + 'static,
  {
    if page_token.is_none() {
      if let Some(hit) = self.cached_page(collection, page_size) {
        debug!(collection, entity = T::entity_type(), "collection cache hit");
        return Ok(hit);
      }
    }

    let key = list_request_key(collection, page_token);
    let is_first_page = page_token.is_none();
    let storage = Arc::clone(&self.storage);
    let collection = collection.to_string();

    let (request, joined) = self.lists.join_or_start(&key, move |token| {
      let fetch = fetcher();
      async move {
        let page = fetch.await?;
        if is_first_page {
          let mut storage = storage.lock();
          if token.is_superseded() {
            debug!(collection = %collection, "discarding superseded collection fetch");
          } else {
            storage.store_collection(&collection, page.items.clone(), page.next_page_token.clone());
          }
        }
        Ok(page)
      }
    });
    if !joined {
      debug!(key = %key, "collection cache miss");
    }

    request.await.map(CacheResult::from_network)
  }

  /// Fetch a single item with caching and coalescing.
  pub async fn fetch_one<F, Fut>(&self, id: &str, fetcher: F) -> Result<CacheResult<T>, MailError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, MailError>> + Send + 'static,
  {
    let hit = self.storage.lock().get_item(id);
    if let Some(cached) = hit {
      debug!(id, entity = T::entity_type(), "item cache hit");
      return Ok(CacheResult::from_cache(cached.item, cached.fetched_at));
    }

    let key = item_request_key(id);
    let storage = Arc::clone(&self.storage);
    let ttl = self.item_ttl;

    let (request, _) = self.items.join_or_start(&key, move |token| {
      let fetch = fetcher();
      async move {
        let item = fetch.await?;
        let mut storage = storage.lock();
        if !token.is_superseded() {
          storage.store_item(item.clone(), ttl);
        }
        Ok(item)
      }
    });

    request.await.map(CacheResult::from_network)
  }

  /// Patch every cached copy of `id`. Returns how many copies changed.
  ///
  /// Running fetches of the item and of any first page are superseded, so a
  /// copy fetched before the patch cannot overwrite it.
  pub fn patch<F>(&self, id: &str, patch: F) -> usize
  where
    F: Fn(&mut T),
  {
    let mut storage = self.storage.lock();
    self.supersede_fetches_of(id);
    storage.patch(id, patch)
  }

  /// Remove `id` from every collection and from the item table, and make
  /// sure a running fetch cannot put it back.
  pub fn remove(&self, id: &str) -> usize {
    let mut storage = self.storage.lock();
    self.supersede_fetches_of(id);
    storage.remove_everywhere(id)
  }

  /// Any list may contain `id`, so every list fetch goes.
  fn supersede_fetches_of(&self, id: &str) {
    let lists = self.lists.supersede_prefix("list:");
    let item = self.items.supersede(&item_request_key(id));
    if lists > 0 || item {
      debug!(id, lists, item, "superseded fetches overlapping a mutation");
    }
  }

  /// Drop a cached collection and supersede its in-flight page fetches.
  pub fn invalidate(&self, collection: &str) -> bool {
    let mut storage = self.storage.lock();
    let prefix = format!("list:{}:", collection);
    let superseded = self.lists.supersede_prefix(&prefix);
    let removed = storage.remove_collection(collection);
    debug!(collection, removed, superseded, "collection invalidated");
    removed
  }

  /// Drop everything: both tables and every in-flight request.
  pub fn clear(&self) {
    let mut storage = self.storage.lock();
    self.lists.supersede_all();
    self.items.supersede_all();
    storage.clear();
  }

  /// Members of a cached collection regardless of freshness.
  pub fn collection_snapshot(&self, collection: &str) -> Option<Vec<T>> {
    self
      .storage
      .lock()
      .get_collection(collection, Duration::MAX)
      .map(|cached| cached.items.clone())
  }

  /// A cached item, if present and not expired.
  pub fn item_snapshot(&self, id: &str) -> Option<T> {
    self.storage.lock().get_item(id).map(|cached| cached.item)
  }

  pub fn in_flight_count(&self) -> usize {
    self.lists.len() + self.items.len()
  }
}

impl<T: Cacheable> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      lists: self.lists.clone(),
      items: self.items.clone(),
      collection_ttl: self.collection_ttl,
      item_ttl: self.item_ttl,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use futures::FutureExt;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq)]
  struct Doc {
    id: String,
    starred: bool,
  }

  impl Cacheable for Doc {
    fn cache_key(&self) -> &str {
      &self.id
    }

    fn entity_type() -> &'static str {
      "doc"
    }
  }

  fn doc(id: &str) -> Doc {
    Doc {
      id: id.to_string(),
      starred: false,
    }
  }

  fn layer() -> CacheLayer<Doc> {
    CacheLayer::new(Duration::from_secs(30), Duration::from_secs(300))
  }

  fn page_fetcher(
    calls: &Arc<AtomicUsize>,
    ids: &'static [&'static str],
  ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<Page<Doc>, MailError>> {
    let calls = Arc::clone(calls);
    move || {
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Page::new(ids.iter().map(|id| doc(id)).collect(), Some("next".into())))
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_page_served_from_cache_within_ttl() {
    let cache = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = cache
      .fetch_page("INBOX", 20, None, page_fetcher(&calls, &["a", "b", "c"]))
      .await
      .unwrap();
    assert!(!first.is_cached());

    let second = cache
      .fetch_page("INBOX", 2, None, page_fetcher(&calls, &["x"]))
      .await
      .unwrap();
    assert!(second.is_cached());
    assert_eq!(second.data.items, vec![doc("a"), doc("b")]);
    assert_eq!(second.data.next_page_token.as_deref(), Some("next"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let third = cache
      .fetch_page("INBOX", 20, None, page_fetcher(&calls, &["x"]))
      .await
      .unwrap();
    assert!(!third.is_cached());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_later_pages_are_not_cached() {
    let cache = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
      cache
        .fetch_page("INBOX", 20, Some("p2"), page_fetcher(&calls, &["d"]))
        .await
        .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.collection_snapshot("INBOX").is_none());
  }

  #[tokio::test]
  async fn test_failed_fetch_leaves_no_state() {
    let cache = layer();
    let result = cache
      .fetch_page("INBOX", 20, None, || async {
        Err(MailError::operation("server", "list_messages", eyre!("down")))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(cache.in_flight_count(), 0);
    assert!(cache.collection_snapshot("INBOX").is_none());
  }

  #[tokio::test]
  async fn test_fetch_one_caches_item() {
    let cache = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
      let calls = calls.clone();
      let got = cache
        .fetch_one("a", move || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(doc("a"))
        })
        .await
        .unwrap();
      assert_eq!(got.data, doc("a"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_remove_and_patch() {
    let cache = layer();
    let calls = Arc::new(AtomicUsize::new(0));
    cache
      .fetch_page("INBOX", 20, None, page_fetcher(&calls, &["a", "b"]))
      .await
      .unwrap();

    assert_eq!(cache.patch("b", |d| d.starred = true), 1);
    assert!(cache.collection_snapshot("INBOX").unwrap()[1].starred);

    assert_eq!(cache.remove("a"), 1);
    let members = cache.collection_snapshot("INBOX").unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id, "b");
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let cache = layer();
    let calls = Arc::new(AtomicUsize::new(0));
    cache
      .fetch_page("SENT", 20, None, page_fetcher(&calls, &["a"]))
      .await
      .unwrap();

    assert!(cache.invalidate("SENT"));
    assert!(!cache.invalidate("SENT"));

    cache
      .fetch_page("SENT", 20, None, page_fetcher(&calls, &["a"]))
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_mutation_supersedes_running_page_fetch() {
    let cache = layer();
    let gate = Arc::new(tokio::sync::Notify::new());

    let pending = {
      let cache = cache.clone();
      let gate = gate.clone();
      tokio::spawn(async move {
        cache
          .fetch_page("INBOX", 20, None, move || {
            async move {
              gate.notified().await;
              Ok(Page::new(vec![doc("a"), doc("b")], None))
            }
            .boxed()
          })
          .await
      })
    };
    while cache.in_flight_count() == 0 {
      tokio::task::yield_now().await;
    }

    cache.remove("a");
    assert_eq!(cache.in_flight_count(), 0);
    gate.notify_one();

    let page = pending.await.unwrap().unwrap();
    assert_eq!(page.data.items.len(), 2);
    assert!(cache.collection_snapshot("INBOX").is_none());
  }

  #[test]
  fn test_request_keys() {
    assert_eq!(list_request_key("INBOX", None), "list:INBOX:first");
    assert_eq!(list_request_key("INBOX", Some("abc")), "list:INBOX:abc");
    assert_eq!(item_request_key("m1"), "item:m1");
  }
}
