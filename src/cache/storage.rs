//! In-memory cache tables: collections per query key and items per id.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::traits::Cacheable;

/// A cached first page of a collection.
#[derive(Debug, Clone)]
pub struct CachedCollection<T> {
  /// The cached members in backend order
  pub items: Vec<T>,
  /// When the collection was fetched
  pub fetched_at: Instant,
  /// Continuation token returned with the page
  pub next_page_token: Option<String>,
}

impl<T> CachedCollection<T> {
  pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
    now.saturating_duration_since(self.fetched_at) < ttl
  }
}

/// A single cached item with its expiry.
#[derive(Debug, Clone)]
pub struct CachedItem<T> {
  pub item: T,
  pub fetched_at: Instant,
  pub expires_at: Instant,
}

impl<T> CachedItem<T> {
  pub fn is_expired(&self, now: Instant) -> bool {
    now >= self.expires_at
  }
}

/// Collection and item tables.
///
/// Not synchronized on its own; the cache layer owns it behind a mutex and
/// never holds that mutex across an await point.
#[derive(Debug)]
pub struct MemoryStorage<T> {
  collections: HashMap<String, CachedCollection<T>>,
  items: HashMap<String, CachedItem<T>>,
}

impl<T> Default for MemoryStorage<T> {
  fn default() -> Self {
    Self {
      collections: HashMap::new(),
      items: HashMap::new(),
    }
  }
}

impl<T: Cacheable> MemoryStorage<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Get a collection if it is still within `ttl`.
  pub fn get_collection(&self, key: &str, ttl: Duration) -> Option<&CachedCollection<T>> {
    self
      .collections
      .get(key)
      .filter(|cached| cached.is_fresh(ttl, Instant::now()))
  }

  /// Overwrite the collection stored under `key`.
  pub fn store_collection(&mut self, key: &str, items: Vec<T>, next_page_token: Option<String>) {
    self.collections.insert(
      key.to_string(),
      CachedCollection {
        items,
        fetched_at: Instant::now(),
        next_page_token,
      },
    );
  }

  pub fn remove_collection(&mut self, key: &str) -> bool {
    self.collections.remove(key).is_some()
  }

  /// Get an item, dropping it if it has expired.
  pub fn get_item(&mut self, key: &str) -> Option<CachedItem<T>> {
    let now = Instant::now();
    match self.items.get(key) {
      Some(cached) if cached.is_expired(now) => {
        self.items.remove(key);
        None
      }
      Some(cached) => Some(cached.clone()),
      None => None,
    }
  }

  /// Store an item, replacing any previous entry and its expiry.
  pub fn store_item(&mut self, item: T, ttl: Duration) {
    let now = Instant::now();
    self.purge_expired(now);
    self.items.insert(
      item.cache_key().to_string(),
      CachedItem {
        item,
        fetched_at: now,
        expires_at: now + ttl,
      },
    );
  }

  /// Apply `patch` to every copy of the entity with `key`, in collections and
  /// in the item table. Returns how many copies were touched.
  pub fn patch<F>(&mut self, key: &str, patch: F) -> usize
  where
    F: Fn(&mut T),
  {
    let mut touched = 0;
    for cached in self.collections.values_mut() {
      for member in cached.items.iter_mut().filter(|m| m.cache_key() == key) {
        patch(member);
        touched += 1;
      }
    }
    if let Some(cached) = self.items.get_mut(key) {
      patch(&mut cached.item);
      touched += 1;
    }
    touched
  }

  /// Remove the entity with `key` from every collection and from the item table.
  pub fn remove_everywhere(&mut self, key: &str) -> usize {
    let mut removed = 0;
    for cached in self.collections.values_mut() {
      let before = cached.items.len();
      cached.items.retain(|m| m.cache_key() != key);
      removed += before - cached.items.len();
    }
    if self.items.remove(key).is_some() {
      removed += 1;
    }
    removed
  }

  /// Drop expired items. Returns the number removed.
  pub fn purge_expired(&mut self, now: Instant) -> usize {
    let before = self.items.len();
    self.items.retain(|_, cached| !cached.is_expired(now));
    before - self.items.len()
  }

  pub fn clear(&mut self) {
    self.collections.clear();
    self.items.clear();
  }

  pub fn collection_count(&self) -> usize {
    self.collections.len()
  }

  pub fn item_count(&self) -> usize {
    self.items.len()
  }

  /// True if any cached collection holds a member with `key`, fresh or not.
  pub fn collections_contain(&self, key: &str) -> bool {
    self
      .collections
      .values()
      .any(|cached| cached.items.iter().any(|m| m.cache_key() == key))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Clone, PartialEq)]
  struct Note {
    id: String,
    pinned: bool,
  }

  impl Cacheable for Note {
    fn cache_key(&self) -> &str {
      &self.id
    }

    fn entity_type() -> &'static str {
      "note"
    }
  }

  fn note(id: &str) -> Note {
    Note {
      id: id.to_string(),
      pinned: false,
    }
  }

  const TTL: Duration = Duration::from_secs(30);

  #[tokio::test(start_paused = true)]
  async fn test_collection_expires_after_ttl() {
    let mut storage = MemoryStorage::new();
    storage.store_collection("INBOX", vec![note("a"), note("b")], Some("tok".into()));

    let cached = storage.get_collection("INBOX", TTL).expect("fresh collection");
    assert_eq!(cached.items.len(), 2);
    assert_eq!(cached.next_page_token.as_deref(), Some("tok"));

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(storage.get_collection("INBOX", TTL).is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(storage.get_collection("INBOX", TTL).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_item_expiry_is_checked_on_read() {
    let mut storage = MemoryStorage::new();
    storage.store_item(note("a"), Duration::from_secs(10));
    assert!(storage.get_item("a").is_some());

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(storage.get_item("a").is_none());
    assert_eq!(storage.item_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_restore_replaces_expiry() {
    let mut storage = MemoryStorage::new();
    storage.store_item(note("a"), Duration::from_secs(10));
    tokio::time::advance(Duration::from_secs(8)).await;
    storage.store_item(note("a"), Duration::from_secs(10));
    tokio::time::advance(Duration::from_secs(8)).await;

    assert!(storage.get_item("a").is_some());
    assert_eq!(storage.item_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_store_item_purges_expired_entries() {
    let mut storage = MemoryStorage::new();
    storage.store_item(note("old"), Duration::from_secs(1));
    tokio::time::advance(Duration::from_secs(2)).await;
    storage.store_item(note("new"), Duration::from_secs(1));

    assert_eq!(storage.item_count(), 1);
  }

  #[tokio::test]
  async fn test_patch_touches_collections_and_item() {
    let mut storage = MemoryStorage::new();
    storage.store_collection("INBOX", vec![note("a"), note("b")], None);
    storage.store_collection("STARRED", vec![note("a")], None);
    storage.store_item(note("a"), TTL);

    let touched = storage.patch("a", |n| n.pinned = true);
    assert_eq!(touched, 3);

    let inbox = storage.get_collection("INBOX", TTL).unwrap();
    assert!(inbox.items[0].pinned);
    assert!(!inbox.items[1].pinned);
    assert!(storage.get_item("a").unwrap().item.pinned);
  }

  #[tokio::test]
  async fn test_remove_everywhere() {
    let mut storage = MemoryStorage::new();
    storage.store_collection("INBOX", vec![note("a"), note("b")], None);
    storage.store_collection("SENT", vec![note("a")], None);
    storage.store_item(note("a"), TTL);

    assert_eq!(storage.remove_everywhere("a"), 3);
    assert!(!storage.collections_contain("a"));
    assert!(storage.get_item("a").is_none());
    assert_eq!(storage.get_collection("INBOX", TTL).unwrap().items, vec![note("b")]);
  }

  #[tokio::test]
  async fn test_clear() {
    let mut storage = MemoryStorage::new();
    storage.store_collection("INBOX", vec![note("a")], None);
    storage.store_item(note("a"), TTL);
    storage.clear();

    assert_eq!(storage.collection_count(), 0);
    assert_eq!(storage.item_count(), 0);
  }
}
