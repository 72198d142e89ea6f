//! # Subscription Registry
//!
//! Owns the persisted index:
//!
//! - Topic Index: topic → {fingerprint: refcount}
//! - Fingerprint Index: fingerprint → {subscription id}
//! - Subscription Record: id → hash
//! - Channel Index: channel id → {subscription id}
//!
//! Every mutation is one guarded transaction, so a refcount and its member
//! set always move together and concurrent unregisters of the same id
//! decrement once. Nothing is cached in process memory.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::try_join_all;
use tracing::debug;

use crate::configs::config_fanout::{FanoutConfig, KeySpace};
use crate::connections::store::{Guard, KvStore, Transaction};
use crate::core::model::{fields, NewSubscription, SubscriptionRecord};
use crate::errors::{FanoutError, FanoutResult};
use crate::utils::{new_id, now_unix};

/// Register/unregister/lookup over the shared store.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    subscription_expiration_seconds: Option<u64>,
    use_client_provided_uniq_id: bool,
    track_created_at: bool,
}

impl Registry {
    /// A registry over `store`, laid out and tuned by `config`.
    pub fn new(store: Arc<dyn KvStore>, config: &FanoutConfig) -> Self {
        Self {
            store,
            keys: config.keys(),
            subscription_expiration_seconds: config.subscription_expiration_seconds,
            use_client_provided_uniq_id: config.use_client_provided_uniq_id,
            track_created_at: !config.use_object_idletime,
        }
    }

    /// The key layout in use.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// # Register
    ///
    /// Persists `sub` and indexes it under every `(topic, fingerprint)` it
    /// lists, in one transaction. Returns the subscription id.
    ///
    /// Fails with [`FanoutError::Configuration`] when no channel id or no
    /// `(topic, fingerprint)` pair is given.
    /// A caller-supplied id is used only when `use_client_provided_uniq_id` is
    /// on; otherwise a fresh id is minted. Registering an id that already has a
    /// record replaces that record.
    pub async fn register(&self, sub: NewSubscription) -> FanoutResult<String> {
        let channel_id = sub
            .channel_id
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                FanoutError::Configuration(
                    "subscription must be registered under a channel id".to_string(),
                )
            })?;
        if sub.events.is_empty() {
            return Err(FanoutError::Configuration(
                "subscription must listen on at least one (topic, fingerprint)".to_string(),
            ));
        }

        let id = match &sub.id {
            Some(id) if self.use_client_provided_uniq_id && !id.is_empty() => id.clone(),
            _ => new_id(),
        };

        let tx = self.registration_tx(&id, &channel_id, &sub)?;
        if self.store.exec(tx.clone()).await? {
            debug!("Registered subscription '{}' on channel '{}'", id, channel_id);
            return Ok(id);
        }

        // The id already has a record: replace it.
        debug!("Subscription '{}' exists, replacing it", id);
        self.unregister(&id).await?;
        if self.store.exec(tx).await? {
            Ok(id)
        } else {
            Err(FanoutError::DuplicateSubscription(id))
        }
    }

    fn registration_tx(&self, id: &str, channel_id: &str, sub: &NewSubscription) -> FanoutResult<Transaction> {
        let now = now_unix();
        let subscription_key = self.keys.subscription_key(id);
        let channel_key = self.keys.channel_key(channel_id);
        let events = SubscriptionRecord::event_map(&sub.events);

        let mut tx = Transaction::new().guarded(Guard::Absent(subscription_key.clone()));
        tx.sadd(channel_key.clone(), id);
        let mut record = SubscriptionRecord::to_fields(sub, channel_id, &events, now)?;
        record.push((fields::TOKEN.to_string(), new_id()));
        tx.hset(subscription_key.clone(), record);
        for (topic, fingerprint) in &events {
            tx.zincrby(self.keys.fingerprints_key(topic), fingerprint.clone(), 1.0);
            tx.sadd(self.keys.subscriptions_key(fingerprint), id);
        }

        if let Some(ttl) = sub.ttl_seconds.or(self.subscription_expiration_seconds) {
            tx.expire(channel_key.clone(), ttl);
            tx.expire(subscription_key.clone(), ttl);
        }

        if self.track_created_at {
            tx.hset(
                self.keys.created_at_key(),
                vec![(subscription_key, now.to_string()), (channel_key, now.to_string())],
            );
        }
        Ok(tx)
    }

    /// # Read
    ///
    /// The record for `subscription_id`, or `None` if it is gone or malformed.
    /// Absence is the expected outcome of a race, not an error.
    pub async fn read(&self, subscription_id: &str) -> FanoutResult<Option<SubscriptionRecord>> {
        let raw = self.store.hgetall(&self.keys.subscription_key(subscription_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let record = SubscriptionRecord::from_fields(subscription_id, raw);
        if record.is_none() {
            debug!("Subscription '{}' is malformed, treating as absent", subscription_id);
        }
        Ok(record)
    }

    /// Fingerprints registered under `topic`.
    pub async fn list_fingerprints(&self, topic: &str) -> FanoutResult<Vec<String>> {
        let members = self.store.zrange_with_scores(&self.keys.fingerprints_key(topic)).await?;
        Ok(members.into_iter().map(|(fingerprint, _)| fingerprint).collect())
    }

    /// Subscription ids sharing `fingerprint`.
    pub async fn list_subscriptions(&self, fingerprint: &str) -> FanoutResult<Vec<String>> {
        Ok(self.store.smembers(&self.keys.subscriptions_key(fingerprint)).await?)
    }

    /// Subscription ids for each of `fingerprints`, in one round-trip.
    pub async fn list_subscriptions_many(&self, fingerprints: &[String]) -> FanoutResult<Vec<Vec<String>>> {
        let keys: Vec<String> = fingerprints.iter().map(|f| self.keys.subscriptions_key(f)).collect();
        Ok(self.store.smembers_many(&keys).await?)
    }

    /// # Unregister
    ///
    /// Removes `subscription_id` from every Fingerprint Index entry its record
    /// lists, decrements the matching refcounts, drops it from its channel and
    /// deletes the record. Returns whether anything was removed; calling it for
    /// an absent id is a no-op.
    pub async fn unregister(&self, subscription_id: &str) -> FanoutResult<bool> {
        let subscription_key = self.keys.subscription_key(subscription_id);
        let raw = self.store.hgetall(&subscription_key).await?;
        if raw.is_empty() {
            return Ok(false);
        }

        // A malformed record still gets deleted; it just has no index entries to undo.
        let events: BTreeMap<String, String> = raw
            .get(fields::EVENTS)
            .and_then(|e| serde_json::from_str(e).ok())
            .unwrap_or_default();

        // Pin the exact record read above: a re-registration in between
        // carries a new token and must not be undone with these events.
        let guard = match raw.get(fields::TOKEN).filter(|t| !t.is_empty()) {
            Some(token) => Guard::FieldEquals {
                key: subscription_key.clone(),
                field: fields::TOKEN.to_string(),
                value: token.clone(),
            },
            None => Guard::Exists(subscription_key.clone()),
        };
        let mut tx = Transaction::new().guarded(guard);
        for (topic, fingerprint) in &events {
            tx.srem(self.keys.subscriptions_key(fingerprint), subscription_id);
            tx.zincrby(self.keys.fingerprints_key(topic), fingerprint.clone(), -1.0);
        }
        if let Some(channel_id) = raw.get(fields::CHANNEL).filter(|c| !c.is_empty()) {
            tx.srem(self.keys.channel_key(channel_id), subscription_id);
        }
        tx.del(subscription_key.clone());
        tx.hdel(self.keys.created_at_key(), subscription_key);

        let removed = self.store.exec(tx).await?;
        if removed {
            debug!("Unregistered subscription '{}'", subscription_id);
        }
        Ok(removed)
    }

    /// # Unregister Channel
    ///
    /// Unregisters every subscription created under `channel_id`, then deletes
    /// the Channel Index entry. Returns how many subscriptions were removed; a
    /// channel with no entry is a no-op.
    pub async fn unregister_channel(&self, channel_id: &str) -> FanoutResult<usize> {
        let channel_key = self.keys.channel_key(channel_id);
        let ids = self.store.smembers(&channel_key).await?;

        let outcomes = try_join_all(ids.iter().map(|id| self.unregister(id))).await?;
        let removed = outcomes.into_iter().filter(|removed| *removed).count();

        let mut tx = Transaction::new();
        tx.del(channel_key.clone());
        tx.hdel(self.keys.created_at_key(), channel_key);
        self.store.exec(tx).await?;

        if !ids.is_empty() {
            debug!("Channel '{}' closed, {} subscription(s) removed", channel_id, removed);
        }
        Ok(removed)
    }
}
