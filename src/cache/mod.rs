//! Generic in-memory caching layer with request coalescing.
//!
//! This module provides a mail-agnostic caching mechanism that:
//! - Caches the first page of each collection for a TTL
//! - Caches single items with a lazily checked expiry
//! - Coalesces concurrent identical requests onto one in-flight request
//! - Patches or removes cached entities in place after mutations

mod inflight;
mod layer;
mod storage;
mod traits;

pub use inflight::{FlightToken, InFlight, SharedRequest};
pub use layer::{item_request_key, list_request_key, CacheLayer};
pub use storage::{CachedCollection, CachedItem, MemoryStorage};
pub use traits::{CacheResult, CacheSource, Cacheable, Page};
