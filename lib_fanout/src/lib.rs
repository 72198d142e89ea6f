//! # lib_fanout
//!
//! Server-side fan-out for long-lived subscriptions whose state lives entirely
//! in a shared key-value store. Any process may register, trigger, or sweep;
//! none of them keeps subscriber state in memory.
//!
//! - [`crate::core::registry::Registry`] indexes subscriptions by topic and fingerprint.
//! - [`crate::core::dispatcher::FanoutEngine`] evaluates once per fingerprint group and
//!   delivers once per group.
//! - [`crate::core::sweeper::Sweeper`] removes expired and orphaned index entries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Runtime configuration and the persisted key layout.
pub mod configs;
/// Store seam plus Redis and in-memory implementations.
pub mod connections;
/// Registry, fan-out engine, sweeper and stats.
pub mod core;
/// Error taxonomy of the core.
pub mod errors;
/// Tracing subscriber setup.
#[cfg(feature = "loggers")]
pub mod loggers;
/// Small helpers for ids and clocks.
pub mod utils;

// --- Public API Re-exports ---
pub use configs::config_fanout::{ConfigLayer, FanoutConfig, KeySpace};
pub use connections::cache_memory::MemoryStore;
#[cfg(feature = "redis")]
pub use connections::cache_redis::{RedisBroadcaster, RedisStore};
pub use connections::store::{Guard, KvStore, ScanPage, StoreError, Transaction, TxOp};
pub use crate::core::channel::{channel_id_for, ChannelState, MemoryChannelState};
pub use crate::core::dispatcher::{Delivery, Evaluator, FanoutEngine, TriggerReport};
pub use crate::core::model::{
    topic_for, ContextCodec, EventKey, JsonContextCodec, NewSubscription, SubscriptionRecord,
    TriggerEvent,
};
pub use crate::core::registry::Registry;
pub use crate::core::stats::{Stats, StatsReport, StatsTotals};
pub use crate::core::sweeper::{SweepReport, Sweeper};
pub use errors::FanoutError;
