//! # Connections Module
//!
//! The store seam the core is written against, and its implementations.

/// The `KvStore` trait, transactions, guards and scan pages.
pub mod store;

/// Process-local store with Redis semantics.
pub mod cache_memory;

/// Redis-backed store and pub/sub broadcaster.
#[cfg(feature = "redis")]
pub mod cache_redis;
