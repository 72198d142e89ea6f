//! End-to-end behaviour of register, trigger, unregister and sweep over the
//! in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use lib_fanout::errors::FanoutResult;
use lib_fanout::{
    channel_id_for, Delivery, Evaluator, FanoutConfig, FanoutEngine, KvStore, MemoryChannelState,
    MemoryStore, NewSubscription, Registry, SubscriptionRecord, Sweeper, Transaction, TriggerEvent,
};

#[derive(Default)]
struct RecordingEvaluator {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Evaluator for RecordingEvaluator {
    async fn evaluate(&self, subscription: &SubscriptionRecord, event: &TriggerEvent) -> FanoutResult<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(subscription.id.clone());
        Ok(Some(json!({ "result": { "data": event.object.clone() }, "more": true })))
    }
}

#[derive(Default)]
struct RecordingDelivery {
    sent: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, address: &str, payload: &Value) {
        self.sent.lock().unwrap().push((address.to_string(), payload.clone()));
    }
}

struct World {
    store: Arc<MemoryStore>,
    config: FanoutConfig,
    registry: Registry,
    evaluator: Arc<RecordingEvaluator>,
    delivery: Arc<RecordingDelivery>,
    engine: FanoutEngine,
}

fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    let config = FanoutConfig::default();
    let registry = Registry::new(store.clone(), &config);
    let evaluator = Arc::new(RecordingEvaluator::default());
    let delivery = Arc::new(RecordingDelivery::default());
    let engine = FanoutEngine::new(registry.clone(), evaluator.clone(), delivery.clone());
    World { store, config, registry, evaluator, delivery, engine }
}

async fn delete_record_directly(world: &World, id: &str) {
    let mut tx = Transaction::new();
    tx.del(world.registry.keys().subscription_key(id));
    world.store.exec(tx).await.unwrap();
}

#[tokio::test]
async fn orphaned_member_is_skipped_then_swept() {
    let w = world();
    for id in ["A", "B", "C"] {
        w.registry
            .register(NewSubscription::new("subscription { t }", "ch").with_id(id).with_event(":T", "F1"))
            .await
            .unwrap();
    }
    delete_record_directly(&w, "B").await;

    let report = w.engine.trigger("T", Value::Null, json!({ "n": 1 })).await.unwrap();

    assert_eq!(w.evaluator.calls.load(Ordering::SeqCst), 1);
    let seen = w.evaluator.seen.lock().unwrap().clone();
    assert!(seen == ["A"] || seen == ["C"], "evaluated {seen:?}");

    let sent = w.delivery.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, w.registry.keys().group_address("F1"));
    assert_eq!(sent[0].1["result"]["data"], json!({ "n": 1 }));
    assert_eq!(report.get("F1"), Some(&3));

    Sweeper::new(w.store.clone(), &w.config).sweep().await.unwrap();
    assert_eq!(w.registry.list_subscriptions("F1").await.unwrap(), vec!["A", "C"]);
}

#[tokio::test]
async fn channel_unregister_removes_everything_the_connection_created() {
    let w = world();
    let connection = MemoryChannelState::new();
    let channel = channel_id_for(&connection);

    for (id, topic, fingerprint) in [("s1", ":a", "Fa"), ("s2", ":b", "Fb"), ("s3", ":b", "Fb2")] {
        w.registry
            .register(NewSubscription::new("q", channel.clone()).with_id(id).with_event(topic, fingerprint))
            .await
            .unwrap();
    }
    let keep = NewSubscription::new("q", "other").with_id("s4").with_event(":b", "Fb");
    w.registry.register(keep).await.unwrap();

    assert_eq!(w.registry.unregister_channel(&channel_id_for(&connection)).await.unwrap(), 3);

    for id in ["s1", "s2", "s3"] {
        assert!(w.registry.read(id).await.unwrap().is_none());
    }
    assert!(w.registry.list_subscriptions("Fa").await.unwrap().is_empty());
    assert_eq!(w.registry.list_subscriptions("Fb").await.unwrap(), vec!["s4"]);
    assert!(!w.store.exists(&w.registry.keys().channel_key(&channel)).await.unwrap());

    let report = w.engine.trigger("b", Value::Null, json!(null)).await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report.get("Fb"), Some(&1));
}

#[tokio::test]
async fn unregister_twice_or_unknown_is_silent() {
    let w = world();
    w.registry
        .register(NewSubscription::new("q", "ch").with_id("A").with_event(":T", "F1"))
        .await
        .unwrap();
    w.registry
        .register(NewSubscription::new("q", "ch").with_id("B").with_event(":T", "F1"))
        .await
        .unwrap();

    assert!(w.registry.unregister("A").await.unwrap());
    let after_first = w.store.keys().unwrap();
    assert!(!w.registry.unregister("A").await.unwrap());
    assert!(!w.registry.unregister("never-existed").await.unwrap());
    assert_eq!(w.store.keys().unwrap(), after_first);

    let scores = w.store.zrange_with_scores(&w.registry.keys().fingerprints_key(":T")).await.unwrap();
    assert_eq!(scores, vec![("F1".to_string(), 1.0)]);
}

#[tokio::test]
async fn trigger_arguments_select_the_topic() {
    let w = world();
    w.registry
        .register(NewSubscription::new("q", "ch").with_id("one").with_event(":postUpdated:id:1", "P1"))
        .await
        .unwrap();
    w.registry
        .register(NewSubscription::new("q", "ch").with_id("two").with_event(":postUpdated:id:2", "P2"))
        .await
        .unwrap();

    let report = w.engine.trigger("postUpdated", json!({ "id": 2 }), json!({ "title": "x" })).await.unwrap();

    assert_eq!(report.keys().collect::<Vec<_>>(), vec!["P2"]);
    assert_eq!(*w.evaluator.seen.lock().unwrap(), vec!["two"]);
}
