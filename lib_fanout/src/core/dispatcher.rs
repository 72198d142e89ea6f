//! # Trigger Fan-Out Engine
//!
//! Turns one "topic changed" report into at most one evaluation and one
//! delivery per fingerprint group.
//!
//! ## Flow per trigger
//!
//! 1.  **Discover fingerprints** of the event's topic. None means a silent,
//!     single-lookup no-op.
//! 2.  **Discover members** of every fingerprint in one batched round-trip.
//! 3.  **Evaluate once per group**: walk members in index order, skip ids whose
//!     record has vanished, and stop at the first member whose evaluation
//!     yields a result. Membership lists may be stale; a stale id costs one
//!     skipped read, never the group.
//! 4.  **Deliver** that result once to the group's shared address.
//!
//! No lock is taken around evaluation. Concurrent triggers on the same topic
//! simply race and each tolerates the other's deletions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::model::{SubscriptionRecord, TriggerEvent};
use crate::core::registry::Registry;
use crate::errors::{FanoutError, FanoutResult};

/// Runs a stored subscription against an event.
///
/// Must be deterministic per fingerprint: any two members of a group produce
/// the same result. Must tolerate a partially stale context.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// The result to deliver, or `None` when this event produces nothing for
    /// the subscription.
    async fn evaluate(
        &self,
        subscription: &SubscriptionRecord,
        event: &TriggerEvent,
    ) -> FanoutResult<Option<Value>>;
}

/// Broadcasts a payload to every listener of a group address.
///
/// Fire-and-forget: failures are the transport's to handle.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Sends `payload` to everyone listening on `address`.
    async fn deliver(&self, address: &str, payload: &Value);
}

/// Fingerprint → number of indexed members, for every group that received a delivery.
pub type TriggerReport = BTreeMap<String, usize>;

/// # Core Fan-Out Engine
///
/// Stateless: holds only handles to the registry and the two collaborators,
/// so any number of processes can run triggers against the same store.
#[derive(Clone)]
pub struct FanoutEngine {
    registry: Registry,
    evaluator: Arc<dyn Evaluator>,
    delivery: Arc<dyn Delivery>,
}

impl FanoutEngine {
    /// An engine over `registry` using the given collaborators.
    pub fn new(registry: Registry, evaluator: Arc<dyn Evaluator>, delivery: Arc<dyn Delivery>) -> Self {
        Self { registry, evaluator, delivery }
    }

    /// The registry this engine reads.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Derives the topic from `name` and `arguments` and fans `object` out to it.
    pub async fn trigger(&self, name: &str, arguments: Value, object: Value) -> FanoutResult<TriggerReport> {
        self.trigger_event(&TriggerEvent::new(name, arguments, object)).await
    }

    /// # Trigger
    ///
    /// Fans `event` out to every fingerprint group under its topic. Store
    /// failures propagate; vanished subscriptions and empty results do not.
    pub async fn trigger_event(&self, event: &TriggerEvent) -> FanoutResult<TriggerReport> {
        let mut report = TriggerReport::new();

        // --- 1. Fingerprints of the topic ---
        let fingerprints = self.registry.list_fingerprints(&event.topic).await?;
        if fingerprints.is_empty() {
            debug!("No subscribers for topic '{}'", event.topic);
            return Ok(report);
        }

        // --- 2. Members of every group, one round-trip ---
        let groups = self.registry.list_subscriptions_many(&fingerprints).await?;

        // --- 3 & 4. Evaluate once, deliver once ---
        for (fingerprint, members) in fingerprints.iter().zip(groups) {
            if members.is_empty() {
                continue;
            }
            match self.evaluate_group(fingerprint, &members, event).await? {
                Some(result) => {
                    let address = self.registry.keys().group_address(fingerprint);
                    self.delivery.deliver(&address, &result).await;
                    report.insert(fingerprint.clone(), members.len());
                }
                None => {
                    debug!("Group '{}' produced no result, skipping", fingerprint);
                }
            }
        }

        info!(
            "Trigger '{}' delivered to {} of {} group(s)",
            event.topic,
            report.len(),
            fingerprints.len()
        );
        Ok(report)
    }

    /// First live member with a non-empty evaluation wins.
    async fn evaluate_group(
        &self,
        fingerprint: &str,
        members: &[String],
        event: &TriggerEvent,
    ) -> FanoutResult<Option<Value>> {
        for subscription_id in members {
            let Some(subscription) = self.registry.read(subscription_id).await? else {
                debug!("Subscription '{}' vanished, trying next member of '{}'", subscription_id, fingerprint);
                continue;
            };

            match self.evaluator.evaluate(&subscription, event).await {
                Ok(Some(result)) => return Ok(Some(result)),
                Ok(None) => continue,
                Err(FanoutError::Store(e)) => return Err(FanoutError::Store(e)),
                Err(e) => {
                    warn!(
                        "Evaluation of subscription '{}' for '{}' failed: {}",
                        subscription_id, fingerprint, e
                    );
                }
            }
        }
        Ok(None)
    }

    /// Evaluating a single subscription by id is not supported: without the
    /// fingerprint there is no way to know who else shares the result. Use
    /// [`FanoutEngine::trigger`].
    pub async fn execute_subscription(&self, subscription_id: &str) -> FanoutResult<TriggerReport> {
        Err(FanoutError::UnsupportedOperation(format!(
            "cannot evaluate subscription '{subscription_id}' without its fingerprint; trigger its topic instead"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::config_fanout::FanoutConfig;
    use crate::connections::cache_memory::MemoryStore;
    use crate::connections::store::{KvStore, Transaction};
    use crate::core::model::NewSubscription;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingEvaluator {
        calls: AtomicUsize,
        evaluated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Evaluator for CountingEvaluator {
        async fn evaluate(&self, sub: &SubscriptionRecord, event: &TriggerEvent) -> FanoutResult<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.evaluated.lock().unwrap().push(sub.id.clone());
            Ok(Some(json!({ "data": event.object.clone() })))
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

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Registry,
        evaluator: Arc<CountingEvaluator>,
        delivery: Arc<RecordingDelivery>,
        engine: FanoutEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store.clone(), &FanoutConfig::default());
        let evaluator = Arc::new(CountingEvaluator::default());
        let delivery = Arc::new(RecordingDelivery::default());
        let engine = FanoutEngine::new(registry.clone(), evaluator.clone(), delivery.clone());
        Harness { store, registry, evaluator, delivery, engine }
    }

    async fn subscribe(registry: &Registry, id: &str, topic: &str, fingerprint: &str) {
        registry
            .register(NewSubscription::new("subscription", "ch").with_id(id).with_event(topic, fingerprint))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn each_group_is_evaluated_and_delivered_once() {
        for size in [1usize, 2, 25] {
            let h = harness();
            for i in 0..size {
                subscribe(&h.registry, &format!("s{i}"), ":postUpdated:id:1", "F1").await;
            }

            let report = h.engine.trigger("postUpdated", json!({ "id": 1 }), json!({ "title": "t" })).await.unwrap();

            assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 1, "group size {size}");
            let sent = h.delivery.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, h.registry.keys().group_address("F1"));
            assert_eq!(sent[0].1, json!({ "data": { "title": "t" } }));
            assert_eq!(report.get("F1"), Some(&size));
        }
    }

    #[tokio::test]
    async fn distinct_fingerprints_are_independent_groups() {
        let h = harness();
        subscribe(&h.registry, "a", ":t", "F1").await;
        subscribe(&h.registry, "b", ":t", "F1").await;
        subscribe(&h.registry, "c", ":t", "F2").await;
        subscribe(&h.registry, "d", ":t", "F3").await;
        subscribe(&h.registry, "e", ":other", "F4").await;

        let report = h.engine.trigger("t", Value::Null, json!(1)).await.unwrap();

        assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.delivery.sent.lock().unwrap().len(), 3);
        assert_eq!(report.keys().cloned().collect::<Vec<_>>(), vec!["F1", "F2", "F3"]);
    }

    #[tokio::test]
    async fn topic_without_subscribers_is_silent() {
        let h = harness();
        let report = h.engine.trigger("nobody", json!({}), Value::Null).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 0);
        assert!(h.delivery.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn vanished_member_is_skipped_for_the_next_live_one() {
        let h = harness();
        for id in ["A", "B", "C"] {
            subscribe(&h.registry, id, ":T", "F1").await;
        }
        // Delete B's record behind the registry's back.
        let mut tx = Transaction::new();
        tx.del(h.registry.keys().subscription_key("B"));
        h.store.exec(tx).await.unwrap();

        let report = h.engine.trigger("T", Value::Null, json!("x")).await.unwrap();

        assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 1);
        let evaluated = h.evaluator.evaluated.lock().unwrap().clone();
        assert!(evaluated == ["A"] || evaluated == ["C"]);
        assert_eq!(h.delivery.sent.lock().unwrap().len(), 1);
        assert_eq!(report.get("F1"), Some(&3));
    }

    #[tokio::test]
    async fn whole_group_gone_means_no_delivery_and_no_error() {
        let h = harness();
        for id in ["A", "B"] {
            subscribe(&h.registry, id, ":T", "F1").await;
        }
        let mut tx = Transaction::new();
        tx.del(h.registry.keys().subscription_key("A"))
            .del(h.registry.keys().subscription_key("B"));
        h.store.exec(tx).await.unwrap();

        let report = h.engine.trigger("T", Value::Null, Value::Null).await.unwrap();

        assert!(report.is_empty());
        assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 0);
        assert!(h.delivery.sent.lock().unwrap().is_empty());
    }

    /// Deletes each member it is handed until `survivors` remain, returning
    /// nothing for the deleted ones.
    struct RacingEvaluator {
        store: Arc<MemoryStore>,
        registry: Registry,
        calls: AtomicUsize,
        kill: usize,
    }

    #[async_trait]
    impl Evaluator for RacingEvaluator {
        async fn evaluate(&self, sub: &SubscriptionRecord, _event: &TriggerEvent) -> FanoutResult<Option<Value>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.kill {
                let mut tx = Transaction::new();
                tx.del(self.registry.keys().subscription_key(&sub.id));
                self.store.exec(tx).await?;
                return Ok(None);
            }
            Ok(Some(json!({ "from": sub.id })))
        }
    }

    #[tokio::test]
    async fn members_expiring_mid_evaluation_do_not_fail_the_group() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store.clone(), &FanoutConfig::default());
        for id in ["A", "B", "C", "D"] {
            subscribe(&registry, id, ":T", "F1").await;
        }
        let evaluator = Arc::new(RacingEvaluator {
            store: store.clone(),
            registry: registry.clone(),
            calls: AtomicUsize::new(0),
            kill: 2,
        });
        let delivery = Arc::new(RecordingDelivery::default());
        let engine = FanoutEngine::new(registry, evaluator.clone(), delivery.clone());

        engine.trigger("T", Value::Null, Value::Null).await.unwrap();

        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 3);
        let sent = delivery.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, json!({ "from": "C" }));
    }

    struct FailingEvaluator;

    #[async_trait]
    impl Evaluator for FailingEvaluator {
        async fn evaluate(&self, sub: &SubscriptionRecord, _event: &TriggerEvent) -> FanoutResult<Option<Value>> {
            if sub.id == "bad" {
                return Err(FanoutError::Evaluation("stale context".into()));
            }
            Ok(Some(json!(sub.id)))
        }
    }

    #[tokio::test]
    async fn evaluator_failure_skips_only_that_member() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store, &FanoutConfig::default());
        subscribe(&registry, "bad", ":T", "F1").await;
        subscribe(&registry, "good", ":T", "F1").await;
        let delivery = Arc::new(RecordingDelivery::default());
        let engine = FanoutEngine::new(registry, Arc::new(FailingEvaluator), delivery.clone());

        let report = engine.trigger("T", Value::Null, Value::Null).await.unwrap();

        assert_eq!(report.get("F1"), Some(&2));
        assert_eq!(delivery.sent.lock().unwrap()[0].1, json!("good"));
    }

    #[tokio::test]
    async fn single_subscription_execution_is_unsupported() {
        let h = harness();
        subscribe(&h.registry, "A", ":T", "F1").await;
        let err = h.engine.execute_subscription("A").await.unwrap_err();
        assert!(matches!(err, FanoutError::UnsupportedOperation(_)));
        assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 0);
    }
}
