//! # Core Fan-Out Module
//!
//! Everything between a transport and the shared store.
//!
//! ## Core Components:
//!
//! - **`model`**: subscription and event types, topic derivation, and the
//!   context codec used to persist caller context.
//!
//! - **`channel`**: the per-connection slot that carries a channel id, so one
//!   disconnect can remove every subscription a connection created.
//!
//! - **`registry`**: writes and removes the Topic, Fingerprint, Subscription
//!   and Channel indexes as single atomic transactions.
//!
//! - **`dispatcher`**: the fan-out engine. Evaluates one live member per
//!   fingerprint group and delivers the result once to the group address.
//!
//! - **`sweeper`**: out-of-band reclamation of expired and orphaned entries.
//!
//! - **`stats`**: read-only counts over the persisted layout.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Per-connection channel id capability.
pub mod channel;
/// The fan-out engine with its evaluator and delivery seams.
pub mod dispatcher;
/// Subscription, event and topic types.
pub mod model;
/// Index maintenance for register and unregister.
pub mod registry;
/// Aggregate counts over the persisted layout.
pub mod stats;
/// Batch reclamation of stale entries.
pub mod sweeper;

// --- Public API Re-exports ---
pub use dispatcher::{Delivery, Evaluator, FanoutEngine, TriggerReport};
pub use registry::Registry;
pub use stats::{Stats, StatsReport, StatsTotals};
pub use sweeper::{SweepReport, Sweeper};
