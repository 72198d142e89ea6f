//! # Redis Fan-Out Live Test
//!
//! Runs the orphaned-member scenario against a real Redis server
//! (`FANOUT_REDIS_URL`, default `redis://127.0.0.1:6379/`) under a random key
//! prefix, then removes every key it created.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{Value, json};

use lib_fanout::errors::FanoutResult;
use lib_fanout::{
    Delivery, Evaluator, FanoutConfig, FanoutEngine, KvStore, NewSubscription, RedisBroadcaster,
    RedisStore, Registry, SubscriptionRecord, Sweeper, Transaction, TriggerEvent,
};

#[derive(Default)]
struct CountingEvaluator {
    calls: AtomicUsize,
}

#[async_trait]
impl Evaluator for CountingEvaluator {
    async fn evaluate(&self, _subscription: &SubscriptionRecord, event: &TriggerEvent) -> FanoutResult<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(json!({ "result": { "data": event.object.clone() }, "more": true })))
    }
}

/// Records each delivery, then forwards it to Redis pub/sub.
struct TeeDelivery {
    sent: Mutex<Vec<String>>,
    inner: RedisBroadcaster,
}

#[async_trait]
impl Delivery for TeeDelivery {
    async fn deliver(&self, address: &str, payload: &Value) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(address.to_string());
        }
        self.inner.deliver(address, payload).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let redis_url = std::env::var("FANOUT_REDIS_URL").unwrap_or_else(|_| FanoutConfig::default().redis_url);
    let config = FanoutConfig {
        redis_url,
        redis_prefix: format!("fanout-test-{}", uuid::Uuid::new_v4().simple()),
        ..Default::default()
    };

    println!("[*] Connecting to {} with prefix {}", config.redis_url, config.redis_prefix);
    let store = Arc::new(RedisStore::connect(&config.redis_url).await.context("Redis connection failed")?);

    let outcome = run_scenario(store.clone(), &config).await;
    let removed = cleanup(store.as_ref(), &config).await?;
    println!("[*] Removed {} test key(s)", removed);

    match outcome {
        Ok(()) => {
            println!("\n[SUCCESS] Live fan-out scenario passed");
            Ok(())
        }
        Err(e) => {
            eprintln!("\n[ERROR] Live fan-out scenario failed:");
            eprintln!(">>> {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run_scenario(store: Arc<RedisStore>, config: &FanoutConfig) -> Result<()> {
    let registry = Registry::new(store.clone(), config);
    let evaluator = Arc::new(CountingEvaluator::default());
    let delivery = Arc::new(TeeDelivery {
        sent: Mutex::new(Vec::new()),
        inner: RedisBroadcaster::new(store.connection(), config.broadcast_channel.clone()),
    });
    let engine = FanoutEngine::new(registry.clone(), evaluator.clone(), delivery.clone());

    // --- A, B, C share F1; B's record vanishes behind the registry's back ---
    for id in ["A", "B", "C"] {
        registry
            .register(NewSubscription::new("subscription { t }", "live-ch").with_id(id).with_event(":T", "F1"))
            .await?;
    }
    let mut tx = Transaction::new();
    tx.del(registry.keys().subscription_key("B"));
    store.exec(tx).await?;

    let report = engine.trigger("T", Value::Null, json!({ "live": true })).await?;
    ensure!(evaluator.calls.load(Ordering::SeqCst) == 1, "evaluator ran more than once");
    let sent = delivery.sent.lock().map(|s| s.clone()).unwrap_or_default();
    ensure!(sent == [registry.keys().group_address("F1")], "unexpected deliveries {:?}", sent);
    ensure!(report.get("F1") == Some(&3), "unexpected report {:?}", report);
    println!("[OK] one evaluation, one delivery for a group with an orphan");

    Sweeper::new(store.clone(), config).sweep().await?;
    let members = registry.list_subscriptions("F1").await?;
    ensure!(members == ["A", "C"], "sweeper left {:?}", members);
    println!("[OK] sweeper dropped the orphan");

    // --- Concurrent unregisters of one id decrement once ---
    let outcomes = join_all((0..8).map(|_| registry.unregister("A"))).await;
    let removed = outcomes.into_iter().collect::<FanoutResult<Vec<bool>>>()?.into_iter().filter(|r| *r).count();
    ensure!(removed == 1, "{} unregisters claimed the same record", removed);
    let scores = store.zrange_with_scores(&registry.keys().fingerprints_key(":T")).await?;
    ensure!(scores == [("F1".to_string(), 2.0)], "refcount drifted: {:?}", scores);
    println!("[OK] concurrent unregisters decremented once");

    // --- Channel cleanup ---
    let closed = registry.unregister_channel("live-ch").await?;
    if closed != 1 {
        bail!("expected 1 subscription left on the channel, removed {}", closed);
    }
    ensure!(registry.list_subscriptions("F1").await?.is_empty(), "channel cleanup left members");
    println!("[OK] channel cleanup removed the rest");

    Ok(())
}

/// Deletes every key under the test prefix.
async fn cleanup(store: &RedisStore, config: &FanoutConfig) -> Result<usize> {
    let pattern = format!("{}*", config.redis_prefix);
    let mut removed = 0;
    let mut cursor = 0;
    loop {
        let page = store.scan(&pattern, cursor, config.scan_count).await?;
        if !page.items.is_empty() {
            let mut tx = Transaction::new();
            for key in &page.items {
                tx.del(key.clone());
            }
            store.exec(tx).await?;
            removed += page.items.len();
        }
        if page.cursor == 0 {
            return Ok(removed);
        }
        cursor = page.cursor;
    }
}
