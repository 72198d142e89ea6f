//! # Utils
//!
//! Id minting and wall-clock helpers shared by the registry and the sweeper.

use chrono::Utc;
use uuid::Uuid;

/// Returns a fresh random identifier (UUID v4, hyphenated).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current Unix time in whole seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Current Unix time in milliseconds.
pub fn now_unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}
