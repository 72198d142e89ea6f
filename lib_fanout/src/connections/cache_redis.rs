//! # Redis Store Implementation
//!
//! [`KvStore`] over a multiplexed, auto-reconnecting
//! [`ConnectionManager`]. Unguarded transactions run as `MULTI/EXEC`
//! pipelines; guarded ones run as a single Lua script so the precondition and
//! the writes are one atomic unit. The script declares every key it writes.
//! On Redis Cluster those keys must share a hash slot, so give the prefix a
//! hash tag (e.g. `{graphql}`).
//!
//! Also provides [`RedisBroadcaster`], a [`Delivery`] that publishes each
//! group payload on a pub/sub channel for the transport layer to fan out.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde_json::{json, Value};
use tracing::warn;

use super::store::{Guard, KvStore, ScanPage, StoreResult, Transaction};
use crate::core::dispatcher::Delivery;

/// Checks the guard on `KEYS[1]` (`ARGV[1..3]` = mode, field, value), then
/// applies `ARGV[4..]` as `name, argc, args...` triples. Each op's key is the
/// next entry of `KEYS[2..]`, so every key the script touches is declared.
const GUARDED_EXEC: &str = r#"
local mode = ARGV[1]
if mode == 'exists' and redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
if mode == 'absent' and redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
if mode == 'field' and redis.call('HGET', KEYS[1], ARGV[2]) ~= ARGV[3] then return 0 end
local k = 2
local i = 4
while i <= #ARGV do
  local argc = tonumber(ARGV[i + 1])
  local args = { KEYS[k] }
  for j = 1, argc do args[j + 1] = ARGV[i + 1 + j] end
  redis.call(ARGV[i], unpack(args))
  k = k + 1
  i = i + 2 + argc
end
return 1
"#;

/// A handler for Redis-backed index storage.
#[derive(Clone)]
pub struct RedisStore {
    /// Shared connection; cloned per call, all clones multiplex one socket.
    manager: ConnectionManager,
    guarded_exec: Script,
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self::from_manager(manager))
    }

    /// Wraps an existing connection manager.
    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager, guarded_exec: Script::new(GUARDED_EXEC) }
    }

    /// The underlying connection, for callers that need raw commands.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn exec_pipeline(&self, tx: &Transaction) -> StoreResult<bool> {
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in tx.ops() {
            let (name, args) = op.command();
            pipe.cmd(name).arg(args).ignore();
        }
        pipe.query_async::<()>(&mut con).await?;
        Ok(true)
    }

    async fn exec_script(&self, guard: &Guard, tx: &Transaction) -> StoreResult<bool> {
        let mut con = self.manager.clone();
        let (keys, argv) = script_call(guard, tx);
        let mut invocation = self.guarded_exec.prepare_invoke();
        invocation.key(keys).arg(argv);
        let applied: i64 = invocation.invoke_async(&mut con).await?;
        Ok(applied == 1)
    }
}

/// `KEYS` and `ARGV` for [`GUARDED_EXEC`].
fn script_call(guard: &Guard, tx: &Transaction) -> (Vec<String>, Vec<String>) {
    let (mode, key, field, value) = match guard {
        Guard::Exists(key) => ("exists", key, "", ""),
        Guard::Absent(key) => ("absent", key, "", ""),
        Guard::FieldEquals { key, field, value } => ("field", key, field.as_str(), value.as_str()),
    };

    let mut keys = vec![key.clone()];
    let mut argv = vec![mode.to_string(), field.to_string(), value.to_string()];
    for op in tx.ops() {
        let (name, args) = op.command();
        let Some((op_key, rest)) = args.split_first() else {
            continue;
        };
        keys.push(op_key.clone());
        argv.push(name.to_string());
        argv.push(rest.len().to_string());
        argv.extend_from_slice(rest);
    }
    (keys, argv)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut con = self.manager.clone();
        Ok(con.smembers(key).await?)
    }

    async fn smembers_many(&self, keys: &[String]) -> StoreResult<Vec<Vec<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.smembers(key);
        }
        Ok(pipe.query_async(&mut con).await?)
    }

    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        let mut con = self.manager.clone();
        Ok(con.zrange_withscores(key, 0, -1).await?)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut con = self.manager.clone();
        Ok(con.hgetall(key).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut con = self.manager.clone();
        Ok(con.hget(key, field).await?)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut con = self.manager.clone();
        Ok(con.exists(key).await?)
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let mut con = self.manager.clone();
        Ok(con.scard(key).await?)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut con = self.manager.clone();
        Ok(con.zcard(key).await?)
    }

    async fn idle_time(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut con = self.manager.clone();
        Ok(redis::cmd("OBJECT")
            .arg("IDLETIME")
            .arg(key)
            .query_async(&mut con)
            .await?)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage<String>> {
        let mut con = self.manager.clone();
        let (cursor, items): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut con)
            .await?;
        Ok(ScanPage { cursor, items })
    }

    async fn hscan(&self, key: &str, cursor: u64, count: usize) -> StoreResult<ScanPage<(String, String)>> {
        let mut con = self.manager.clone();
        let (cursor, flat): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(key)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut con)
            .await?;
        let items = flat
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        Ok(ScanPage { cursor, items })
    }

    async fn exec(&self, tx: Transaction) -> StoreResult<bool> {
        match tx.guard() {
            None if tx.is_empty() => Ok(true),
            None => self.exec_pipeline(&tx).await,
            Some(guard) => self.exec_script(guard, &tx).await,
        }
    }
}

/// Publishes group payloads on a Redis pub/sub channel.
///
/// Message shape: `{"stream": <group address>, "data": <payload as JSON text>}`,
/// the broadcast envelope WebSocket gateways listen for.
#[derive(Clone)]
pub struct RedisBroadcaster {
    manager: ConnectionManager,
    channel: String,
}

impl RedisBroadcaster {
    /// Broadcasts through `manager` on `channel`.
    pub fn new(manager: ConnectionManager, channel: impl Into<String>) -> Self {
        Self { manager, channel: channel.into() }
    }
}

#[async_trait]
impl Delivery for RedisBroadcaster {
    async fn deliver(&self, address: &str, payload: &Value) {
        let message = json!({ "stream": address, "data": payload.to_string() }).to_string();
        let mut con = self.manager.clone();
        // Fire-and-forget: the transport owns retries.
        if let Err(e) = con.publish::<_, _, ()>(&self.channel, message).await {
            warn!("Broadcast to '{}' on '{}' failed: {}", address, self.channel, e);
        }
    }
}
