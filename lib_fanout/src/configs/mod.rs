//! # Configs Module
//!
//! Layered runtime configuration (defaults, JSON file, caller overrides) and
//! the key layout derived from the configured prefix.

/// `FanoutConfig`, its override layer and the `KeySpace`.
pub mod config_fanout;
