//! Core traits and types for the caching system.

use serde::Serialize;
use tokio::time::Instant;

/// Trait for entities that can be cached.
///
/// Implementors provide a stable key used both for the item table and for
/// locating members inside cached collections.
pub trait Cacheable: Clone + Send + Sync + 'static {
  /// Unique identifier for this entity (e.g., message id)
  fn cache_key(&self) -> &str;

  /// Entity type name used in log output (e.g., "message")
  fn entity_type() -> &'static str;
}

/// One page of a collection plus the token for the page after it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
  pub items: Vec<T>,
  pub next_page_token: Option<String>,
}

impl<T> Page<T> {
  pub fn new(items: Vec<T>, next_page_token: Option<String>) -> Self {
    Self {
      items,
      next_page_token,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched from a backend (if from cache)
  pub cached_at: Option<Instant>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh backend data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_cached(&self) -> bool {
    self.source == CacheSource::Cache
  }

  pub fn into_data(self) -> T {
    self.data
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from a backend for this call (possibly coalesced with another caller)
  Network,
  /// Served from cache within its TTL
  Cache,
}
