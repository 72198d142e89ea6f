//! # In-Memory Store
//!
//! A process-local [`KvStore`] with the Redis semantics the core relies on:
//! missing keys read as empty, collections that become empty disappear, TTLs
//! expire lazily, idle time is tracked per key, scans are cursor based and
//! transactions apply all-or-nothing under their guard.
//!
//! Useful for tests and for single-process embedders. It is not shared across
//! processes, so it does not replace a real store in a multi-process deployment.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::store::{Guard, KvStore, ScanPage, StoreError, StoreResult, Transaction, TxOp};
use crate::utils::now_unix_millis;

#[derive(Debug, Clone)]
enum Data {
    Set(BTreeSet<String>),
    ZSet(BTreeMap<String, f64>),
    Hash(BTreeMap<String, String>),
}

impl Data {
    fn is_empty(&self) -> bool {
        match self {
            Data::Set(s) => s.is_empty(),
            Data::ZSet(z) => z.is_empty(),
            Data::Hash(h) => h.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at_ms: Option<i64>,
    last_access_ms: i64,
}

/// Abandoned scans beyond this many are forgotten; resuming one ends it.
const MAX_OPEN_CURSORS: usize = 1_024;

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    /// Cursor id -> last key (or hash field) examined by that scan. Oldest
    /// entries are evicted past [`MAX_OPEN_CURSORS`].
    cursors: BTreeMap<u64, String>,
    next_cursor: u64,
    clock_offset_ms: i64,
}

impl Inner {
    fn now(&self) -> i64 {
        now_unix_millis() + self.clock_offset_ms
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        entry.expires_at_ms.is_some_and(|at| at <= self.now())
    }

    /// Drops `key` if its TTL has passed.
    fn purge(&mut self, key: &str) {
        let expired = self.entries.get(key).is_some_and(|e| self.is_expired(e));
        if expired {
            self.entries.remove(key);
        }
    }

    /// Live entry for `key`, with its access time refreshed.
    fn touch(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge(key);
        let now = self.now();
        self.entries.get_mut(key).map(|entry| {
            entry.last_access_ms = now;
            entry
        })
    }

    fn remember_cursor(&mut self, last: String) -> u64 {
        self.next_cursor += 1;
        let id = self.next_cursor;
        self.cursors.insert(id, last);
        while self.cursors.len() > MAX_OPEN_CURSORS {
            self.cursors.pop_first();
        }
        id
    }

    fn set_mut(&mut self, key: &str, create: bool) -> StoreResult<Option<&mut BTreeSet<String>>> {
        self.purge(key);
        let now = self.now();
        if create && !self.entries.contains_key(key) {
            self.entries.insert(
                key.to_string(),
                Entry { data: Data::Set(BTreeSet::new()), expires_at_ms: None, last_access_ms: now },
            );
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(entry) => {
                entry.last_access_ms = now;
                match &mut entry.data {
                    Data::Set(set) => Ok(Some(set)),
                    _ => Err(StoreError::WrongType { key: key.to_string() }),
                }
            }
        }
    }

    fn zset_mut(&mut self, key: &str, create: bool) -> StoreResult<Option<&mut BTreeMap<String, f64>>> {
        self.purge(key);
        let now = self.now();
        if create && !self.entries.contains_key(key) {
            self.entries.insert(
                key.to_string(),
                Entry { data: Data::ZSet(BTreeMap::new()), expires_at_ms: None, last_access_ms: now },
            );
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(entry) => {
                entry.last_access_ms = now;
                match &mut entry.data {
                    Data::ZSet(zset) => Ok(Some(zset)),
                    _ => Err(StoreError::WrongType { key: key.to_string() }),
                }
            }
        }
    }

    fn hash_mut(&mut self, key: &str, create: bool) -> StoreResult<Option<&mut BTreeMap<String, String>>> {
        self.purge(key);
        let now = self.now();
        if create && !self.entries.contains_key(key) {
            self.entries.insert(
                key.to_string(),
                Entry { data: Data::Hash(BTreeMap::new()), expires_at_ms: None, last_access_ms: now },
            );
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(entry) => {
                entry.last_access_ms = now;
                match &mut entry.data {
                    Data::Hash(hash) => Ok(Some(hash)),
                    _ => Err(StoreError::WrongType { key: key.to_string() }),
                }
            }
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.data.is_empty()) {
            self.entries.remove(key);
        }
    }

    fn guard_holds(&mut self, guard: Option<&Guard>) -> bool {
        match guard {
            None => true,
            Some(Guard::Exists(key)) => {
                self.purge(key);
                self.entries.contains_key(key)
            }
            Some(Guard::Absent(key)) => {
                self.purge(key);
                !self.entries.contains_key(key)
            }
            Some(Guard::FieldEquals { key, field, value }) => {
                self.purge(key);
                match self.entries.get(key).map(|e| &e.data) {
                    Some(Data::Hash(hash)) => hash.get(field) == Some(value),
                    _ => false,
                }
            }
        }
    }

    fn apply(&mut self, op: &TxOp) -> StoreResult<()> {
        match op {
            TxOp::SAdd { key, member } => {
                if let Some(set) = self.set_mut(key, true)? {
                    set.insert(member.clone());
                }
            }
            TxOp::SRem { key, member } => {
                if let Some(set) = self.set_mut(key, false)? {
                    set.remove(member);
                }
                self.drop_if_empty(key);
            }
            TxOp::ZIncrBy { key, member, delta } => {
                if !delta.is_finite() {
                    return Err(StoreError::InvalidArgument(format!("non-finite increment {delta}")));
                }
                if let Some(zset) = self.zset_mut(key, true)? {
                    *zset.entry(member.clone()).or_insert(0.0) += delta;
                }
            }
            TxOp::ZRem { key, member } => {
                if let Some(zset) = self.zset_mut(key, false)? {
                    zset.remove(member);
                }
                self.drop_if_empty(key);
            }
            TxOp::ZRemRangeByScore { key, max } => {
                if let Some(zset) = self.zset_mut(key, false)? {
                    zset.retain(|_, score| *score > *max);
                }
                self.drop_if_empty(key);
            }
            TxOp::HSet { key, fields } => {
                if let Some(hash) = self.hash_mut(key, true)? {
                    for (field, value) in fields {
                        hash.insert(field.clone(), value.clone());
                    }
                }
                self.drop_if_empty(key);
            }
            TxOp::HDel { key, field } => {
                if let Some(hash) = self.hash_mut(key, false)? {
                    hash.remove(field);
                }
                self.drop_if_empty(key);
            }
            TxOp::Del { key } => {
                self.entries.remove(key);
            }
            TxOp::Expire { key, seconds } => {
                let now = self.now();
                if *seconds == 0 {
                    self.entries.remove(key);
                } else if let Some(entry) = self.touch(key) {
                    entry.expires_at_ms = Some(now + (*seconds as i64) * 1000);
                }
            }
        }
        Ok(())
    }
}

/// Process-local store with Redis-compatible semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Moves this store's clock forward, ageing TTLs and idle times.
    pub fn advance(&self, by: Duration) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.clock_offset_ms += by.as_millis() as i64;
        Ok(())
    }

    /// Every live key, sorted.
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .iter()
            .filter(|(_, e)| !inner.is_expired(e))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.lock()?;
        Ok(inner
            .set_mut(key, false)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn smembers_many(&self, keys: &[String]) -> StoreResult<Vec<Vec<String>>> {
        let mut inner = self.lock()?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(
                inner
                    .set_mut(key, false)?
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default(),
            );
        }
        Ok(out)
    }

    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        let mut inner = self.lock()?;
        let mut members: Vec<(String, f64)> = inner
            .zset_mut(key, false)?
            .map(|zset| zset.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut inner = self.lock()?;
        Ok(inner
            .hash_mut(key, false)?
            .map(|hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        Ok(inner.hash_mut(key, false)?.and_then(|hash| hash.get(field).cloned()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner.touch(key).is_some())
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        Ok(inner.set_mut(key, false)?.map_or(0, |set| set.len() as u64))
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        Ok(inner.zset_mut(key, false)?.map_or(0, |zset| zset.len() as u64))
    }

    async fn idle_time(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut inner = self.lock()?;
        inner.purge(key);
        let now = inner.now();
        Ok(inner
            .entries
            .get(key)
            .map(|entry| ((now - entry.last_access_ms).max(0) / 1000) as u64))
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage<String>> {
        let mut inner = self.lock()?;
        let lower = match cursor {
            0 => Bound::Unbounded,
            _ => match inner.cursors.remove(&cursor) {
                Some(last) => Bound::Excluded(last),
                None => return Ok(ScanPage { cursor: 0, items: Vec::new() }),
            },
        };
        let count = count.max(1);

        // `count` bounds keys examined per call, matching or not.
        let mut items = Vec::new();
        let mut last_examined = None;
        let mut examined = 0;
        let mut exhausted = true;
        for (key, entry) in inner.entries.range::<String, _>((lower, Bound::Unbounded)) {
            if examined >= count {
                exhausted = false;
                break;
            }
            examined += 1;
            last_examined = Some(key.clone());
            if !inner.is_expired(entry) && glob_match(pattern, key) {
                items.push(key.clone());
            }
        }

        let next = match (exhausted, last_examined) {
            (false, Some(last)) => inner.remember_cursor(last),
            _ => 0,
        };
        Ok(ScanPage { cursor: next, items })
    }

    async fn hscan(&self, key: &str, cursor: u64, count: usize) -> StoreResult<ScanPage<(String, String)>> {
        let mut inner = self.lock()?;
        let lower = match cursor {
            0 => Bound::Unbounded,
            _ => match inner.cursors.remove(&cursor) {
                Some(last) => Bound::Excluded(last),
                None => return Ok(ScanPage { cursor: 0, items: Vec::new() }),
            },
        };
        let count = count.max(1);

        let (items, more) = match inner.hash_mut(key, false)? {
            None => (Vec::new(), false),
            Some(hash) => {
                let mut iter = hash.range::<String, _>((lower, Bound::Unbounded));
                let items: Vec<(String, String)> =
                    iter.by_ref().take(count).map(|(f, v)| (f.clone(), v.clone())).collect();
                (items, iter.next().is_some())
            }
        };

        let next = match (more, items.last()) {
            (true, Some((field, _))) => inner.remember_cursor(field.clone()),
            _ => 0,
        };
        Ok(ScanPage { cursor: next, items })
    }

    async fn exec(&self, tx: Transaction) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        if !inner.guard_holds(tx.guard()) {
            return Ok(false);
        }

        // Snapshot every touched key so a failing op leaves nothing behind.
        let mut snapshot: Vec<(String, Option<Entry>)> = Vec::new();
        for op in tx.ops() {
            let key = op_key(op);
            if !snapshot.iter().any(|(k, _)| k == key) {
                snapshot.push((key.to_string(), inner.entries.get(key).cloned()));
            }
        }

        for op in tx.ops() {
            if let Err(e) = inner.apply(op) {
                for (key, entry) in snapshot {
                    match entry {
                        Some(entry) => inner.entries.insert(key, entry),
                        None => inner.entries.remove(&key),
                    };
                }
                return Err(e);
            }
        }
        Ok(true)
    }
}

fn op_key(op: &TxOp) -> &str {
    match op {
        TxOp::SAdd { key, .. }
        | TxOp::SRem { key, .. }
        | TxOp::ZIncrBy { key, .. }
        | TxOp::ZRem { key, .. }
        | TxOp::ZRemRangeByScore { key, .. }
        | TxOp::HSet { key, .. }
        | TxOp::HDel { key, .. }
        | TxOp::Del { key }
        | TxOp::Expire { key, .. } => key,
    }
}

/// Redis-style glob: `*`, `?` and backslash escapes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c if c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_scan(store: &MemoryStore, pattern: &str, count: usize) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = 0;
        loop {
            let page = store.scan(pattern, cursor, count).await.unwrap();
            out.extend(page.items);
            if page.cursor == 0 {
                return out;
            }
            cursor = page.cursor;
        }
    }

    #[test]
    fn glob_matches_like_redis() {
        assert!(glob_match("p-channel:*", "p-channel:abc"));
        assert!(!glob_match("p-subscription:*", "p-subscriptions:abc"));
        assert!(glob_match("a\\*b*", "a*bc"));
        assert!(!glob_match("a\\*b*", "axbc"));
        assert!(glob_match("k?y", "key"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test]
    async fn empty_collections_disappear() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.sadd("s", "a").hset("h", vec![("f".into(), "v".into())]);
        assert!(store.exec(tx).await.unwrap());

        let mut tx = Transaction::new();
        tx.srem("s", "a").hdel("h", "f");
        store.exec(tx).await.unwrap();

        assert!(!store.exists("s").await.unwrap());
        assert!(!store.exists("h").await.unwrap());
        assert!(store.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_score_members_survive_until_trimmed() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.zincrby("z", "a", 1.0).zincrby("z", "b", 2.0).zincrby("z", "a", -1.0);
        store.exec(tx).await.unwrap();
        assert_eq!(
            store.zrange_with_scores("z").await.unwrap(),
            vec![("a".to_string(), 0.0), ("b".to_string(), 2.0)]
        );

        let mut tx = Transaction::new();
        tx.zremrangebyscore("z", 0.0);
        store.exec(tx).await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn guards_are_checked_atomically() {
        let store = MemoryStore::new();

        let mut tx = Transaction::new().guarded(Guard::Exists("rec".into()));
        tx.sadd("s", "a");
        assert!(!store.exec(tx).await.unwrap());
        assert!(!store.exists("s").await.unwrap());

        let mut tx = Transaction::new().guarded(Guard::Absent("rec".into()));
        tx.hset("rec", vec![("q".into(), "1".into())]);
        assert!(store.exec(tx.clone()).await.unwrap());
        assert!(!store.exec(tx).await.unwrap());
    }

    #[tokio::test]
    async fn failing_op_rolls_back_the_whole_transaction() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.hset("h", vec![("f".into(), "v".into())]);
        store.exec(tx).await.unwrap();

        let mut tx = Transaction::new();
        tx.sadd("s", "a").sadd("h", "boom");
        let err = store.exec(tx).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));
        assert!(!store.exists("s").await.unwrap());
        assert_eq!(store.hget("h", "f").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn ttl_and_idle_time_follow_the_clock() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.sadd("short", "a").expire("short", 10).sadd("long", "a");
        store.exec(tx).await.unwrap();

        store.advance(Duration::from_secs(30)).unwrap();
        assert!(!store.exists("short").await.unwrap());
        assert!(store.idle_time("long").await.unwrap().unwrap() >= 30);
        assert_eq!(store.idle_time("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_pages_survive_concurrent_deletes() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        for i in 0..10 {
            tx.sadd(format!("p-channel:{i}"), "x");
        }
        tx.sadd("other", "x");
        store.exec(tx).await.unwrap();

        // "other" sorts first and uses up one of the three examined slots.
        let first = store.scan("p-channel:*", 0, 3).await.unwrap();
        assert_eq!(first.items, vec!["p-channel:0", "p-channel:1"]);
        assert_ne!(first.cursor, 0);

        let mut tx = Transaction::new();
        for key in &first.items {
            tx.del(key.clone());
        }
        store.exec(tx).await.unwrap();

        let mut rest = Vec::new();
        let mut cursor = first.cursor;
        while cursor != 0 {
            let page = store.scan("p-channel:*", cursor, 3).await.unwrap();
            rest.extend(page.items);
            cursor = page.cursor;
        }
        assert_eq!(rest.len(), 8);
        assert_eq!(collect_scan(&store, "p-channel:*", 4).await.len(), 8);
    }

    #[tokio::test]
    async fn scan_count_bounds_keys_examined() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        for i in 0..20 {
            tx.sadd(format!("noise:{i:02}"), "x");
        }
        tx.sadd("z-match", "x");
        store.exec(tx).await.unwrap();

        let page = store.scan("z-*", 0, 5).await.unwrap();
        assert!(page.items.is_empty());
        assert_ne!(page.cursor, 0);
        assert_eq!(collect_scan(&store, "z-*", 5).await, vec!["z-match"]);
    }

    #[tokio::test]
    async fn abandoned_cursors_are_bounded() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.sadd("a", "x").sadd("b", "x");
        store.exec(tx).await.unwrap();

        let first = store.scan("*", 0, 1).await.unwrap();
        for _ in 0..MAX_OPEN_CURSORS + 10 {
            store.scan("*", 0, 1).await.unwrap();
        }
        assert_eq!(store.inner.lock().unwrap().cursors.len(), MAX_OPEN_CURSORS);

        // The evicted cursor ends its scan instead of restarting it.
        let resumed = store.scan("*", first.cursor, 1).await.unwrap();
        assert_eq!(resumed.cursor, 0);
        assert!(resumed.items.is_empty());
    }

    #[tokio::test]
    async fn field_guard_pins_a_hash_value() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.hset("rec", vec![("token".into(), "t1".into())]);
        store.exec(tx).await.unwrap();

        let guard = |value: &str| Guard::FieldEquals {
            key: "rec".into(),
            field: "token".into(),
            value: value.into(),
        };

        let mut stale = Transaction::new().guarded(guard("t0"));
        stale.del("rec");
        assert!(!store.exec(stale).await.unwrap());
        assert!(store.exists("rec").await.unwrap());

        let mut current = Transaction::new().guarded(guard("t1"));
        current.del("rec");
        assert!(store.exec(current).await.unwrap());

        let mut gone = Transaction::new().guarded(guard("t1"));
        gone.sadd("s", "a");
        assert!(!store.exec(gone).await.unwrap());
    }

    #[tokio::test]
    async fn hscan_walks_every_field() {
        let store = MemoryStore::new();
        let fields = (0..5).map(|i| (format!("f{i}"), i.to_string())).collect();
        let mut tx = Transaction::new();
        tx.hset("h", fields);
        store.exec(tx).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = 0;
        loop {
            let page = store.hscan("h", cursor, 2).await.unwrap();
            seen.extend(page.items);
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(store.hscan("absent", 0, 2).await.unwrap().items, vec![]);
    }
}
