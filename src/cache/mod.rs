//! Offline caching for outgoing requests.
//!
//! This module provides:
//! - Named, versioned partitions for static assets, dynamic responses and note data
//! - Cache-first, network-first and stale-while-revalidate read strategies
//! - Request classification and routing (`CacheManager`)
//! - Diversion of failed note saves into the offline queue

mod classify;
mod layer;
mod manager;
mod storage;
mod traits;

pub use manager::CacheManager;
pub use storage::SqliteStorage;
