//! Versioned response storage and the caching strategies built on it.
//!
//! This module provides:
//! - Named stores, one per cache generation, deleted as a whole on upgrade
//! - Entries keyed by canonical request URL (GET only)
//! - Cache-first and network-first strategies with offline fallbacks

mod key;
mod layer;
mod result;
mod storage;

pub use key::RequestKey;
pub use layer::CacheLayer;
pub use result::{CacheResult, CacheSource, CachedEntry};
pub use storage::{CacheStorage, SqliteStorage, StoreHandle};
