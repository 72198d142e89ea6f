//! # Key-Value Store Seam
//!
//! The only surface the core uses to talk to the shared store. Reads are plain
//! methods; every write goes through [`KvStore::exec`] with a [`Transaction`],
//! so atomicity is part of the contract rather than a side effect of one
//! client library.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis driver reported a failure (connectivity, protocol, script).
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A command targeted a key holding another data type.
    #[error("WRONGTYPE operation against key '{key}'")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// The in-memory store's lock was poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    Poisoned,

    /// An argument the store cannot represent (e.g. a non-finite score).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result alias for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// A single write inside a [`Transaction`]. Variant fields name the
/// command arguments; `key` always comes first.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    /// Add `member` to the set at `key`.
    SAdd { key: String, member: String },
    /// Remove `member` from the set at `key`.
    SRem { key: String, member: String },
    /// Add `delta` to the score of `member` in the sorted set at `key`.
    ZIncrBy { key: String, member: String, delta: f64 },
    /// Remove `member` from the sorted set at `key`.
    ZRem { key: String, member: String },
    /// Remove every member whose score is `<= max`.
    ZRemRangeByScore { key: String, max: f64 },
    /// Set hash fields.
    HSet { key: String, fields: Vec<(String, String)> },
    /// Remove a hash field.
    HDel { key: String, field: String },
    /// Delete a key of any type.
    Del { key: String },
    /// Set a TTL on a key.
    Expire { key: String, seconds: u64 },
}

impl TxOp {
    /// The Redis command name and its arguments.
    pub fn command(&self) -> (&'static str, Vec<String>) {
        match self {
            TxOp::SAdd { key, member } => ("SADD", vec![key.clone(), member.clone()]),
            TxOp::SRem { key, member } => ("SREM", vec![key.clone(), member.clone()]),
            TxOp::ZIncrBy { key, member, delta } => {
                ("ZINCRBY", vec![key.clone(), delta.to_string(), member.clone()])
            }
            TxOp::ZRem { key, member } => ("ZREM", vec![key.clone(), member.clone()]),
            TxOp::ZRemRangeByScore { key, max } => {
                ("ZREMRANGEBYSCORE", vec![key.clone(), "-inf".to_string(), max.to_string()])
            }
            TxOp::HSet { key, fields } => {
                let mut args = Vec::with_capacity(1 + fields.len() * 2);
                args.push(key.clone());
                for (field, value) in fields {
                    args.push(field.clone());
                    args.push(value.clone());
                }
                ("HSET", args)
            }
            TxOp::HDel { key, field } => ("HDEL", vec![key.clone(), field.clone()]),
            TxOp::Del { key } => ("DEL", vec![key.clone()]),
            TxOp::Expire { key, seconds } => ("EXPIRE", vec![key.clone(), seconds.to_string()]),
        }
    }
}

/// Precondition checked atomically at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Apply only if the key exists.
    Exists(String),
    /// Apply only if the key does not exist.
    Absent(String),
    /// Apply only if the hash at `key` holds `value` under `field`.
    FieldEquals {
        /// Hash key.
        key: String,
        /// Field to compare.
        field: String,
        /// Expected value.
        value: String,
    },
}

/// An ordered batch of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    guard: Option<Guard>,
    ops: Vec<TxOp>,
}

impl Transaction {
    /// An empty, unguarded transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the whole transaction conditional on `guard`.
    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Appends an arbitrary op.
    pub fn push(&mut self, op: TxOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Appends `SADD`.
    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(TxOp::SAdd { key: key.into(), member: member.into() })
    }

    /// Appends `SREM`.
    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(TxOp::SRem { key: key.into(), member: member.into() })
    }

    /// Appends `ZINCRBY`.
    pub fn zincrby(&mut self, key: impl Into<String>, member: impl Into<String>, delta: f64) -> &mut Self {
        self.push(TxOp::ZIncrBy { key: key.into(), member: member.into(), delta })
    }

    /// Appends `ZREM`.
    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(TxOp::ZRem { key: key.into(), member: member.into() })
    }

    /// Appends `ZREMRANGEBYSCORE key -inf max`.
    pub fn zremrangebyscore(&mut self, key: impl Into<String>, max: f64) -> &mut Self {
        self.push(TxOp::ZRemRangeByScore { key: key.into(), max })
    }

    /// Appends `HSET`.
    pub fn hset(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.push(TxOp::HSet { key: key.into(), fields })
    }

    /// Appends `HDEL`.
    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.push(TxOp::HDel { key: key.into(), field: field.into() })
    }

    /// Appends `DEL`.
    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(TxOp::Del { key: key.into() })
    }

    /// Appends `EXPIRE`.
    pub fn expire(&mut self, key: impl Into<String>, seconds: u64) -> &mut Self {
        self.push(TxOp::Expire { key: key.into(), seconds })
    }

    /// The precondition, if any.
    pub fn guard(&self) -> Option<&Guard> {
        self.guard.as_ref()
    }

    /// The queued ops in order.
    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    /// Whether no op is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One page of a cursor scan. A `cursor` of `0` means the scan is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage<T> {
    /// Cursor to pass to the next call.
    pub cursor: u64,
    /// Items returned by this page.
    pub items: Vec<T>,
}

/// Atomic commands against the shared store.
///
/// Implementations must treat a missing key as an empty collection on reads,
/// and must remove collections that become empty, as Redis does.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Members of the set at `key`.
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Members of several sets, fetched in one round-trip.
    async fn smembers_many(&self, keys: &[String]) -> StoreResult<Vec<Vec<String>>>;

    /// Every member of the sorted set at `key` with its score, ascending.
    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>>;

    /// Every field of the hash at `key`.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// A single hash field.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Whether `key` exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Cardinality of the set at `key`.
    async fn scard(&self, key: &str) -> StoreResult<u64>;

    /// Cardinality of the sorted set at `key`.
    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Seconds since `key` was last accessed, or `None` if the key is absent.
    async fn idle_time(&self, key: &str) -> StoreResult<Option<u64>>;

    /// One page of keys matching a glob `pattern`.
    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage<String>>;

    /// One page of `(field, value)` pairs of the hash at `key`.
    async fn hscan(&self, key: &str, cursor: u64, count: usize) -> StoreResult<ScanPage<(String, String)>>;

    /// Applies `tx` atomically. Returns `false` if its guard did not hold, in
    /// which case nothing was written.
    async fn exec(&self, tx: Transaction) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_render_redis_arguments() {
        let op = TxOp::ZIncrBy { key: "k".into(), member: "m".into(), delta: -1.0 };
        assert_eq!(op.command(), ("ZINCRBY", vec!["k".into(), "-1".into(), "m".into()]));

        let op = TxOp::ZRemRangeByScore { key: "k".into(), max: 0.0 };
        assert_eq!(op.command(), ("ZREMRANGEBYSCORE", vec!["k".into(), "-inf".into(), "0".into()]));

        let op = TxOp::HSet { key: "h".into(), fields: vec![("a".into(), "1".into()), ("b".into(), "2".into())] };
        assert_eq!(op.command().1, vec!["h", "a", "1", "b", "2"]);
    }

    #[test]
    fn every_command_leads_with_its_key() {
        let mut tx = Transaction::new();
        tx.sadd("k0", "m")
            .srem("k1", "m")
            .zincrby("k2", "m", 2.0)
            .zrem("k3", "m")
            .zremrangebyscore("k4", 0.0)
            .hset("k5", vec![("f".into(), "v".into())])
            .hdel("k6", "f")
            .del("k7")
            .expire("k8", 30);

        for (i, op) in tx.ops().iter().enumerate() {
            let (name, args) = op.command();
            assert_eq!(args.first().map(String::as_str), Some(format!("k{i}").as_str()), "{name}");
        }
    }

    #[test]
    fn builder_keeps_order_and_guard() {
        let mut tx = Transaction::new().guarded(Guard::Exists("rec".into()));
        tx.sadd("s", "a").zincrby("z", "f", 1.0).del("rec");

        assert_eq!(tx.guard(), Some(&Guard::Exists("rec".into())));
        assert_eq!(tx.ops().len(), 3);
        assert!(matches!(tx.ops()[2], TxOp::Del { .. }));
    }
}
