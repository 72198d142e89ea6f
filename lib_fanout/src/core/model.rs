//! # Subscription Data Model
//!
//! Typed views of what the registry persists and what a trigger carries.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FanoutResult;

/// Hash field names of a Subscription Record.
pub mod fields {
    /// Query text; a record without it is treated as absent.
    pub const QUERY_STRING: &str = "query_string";
    /// Variables, JSON object.
    pub const VARIABLES: &str = "variables";
    /// Opaque serialized context.
    pub const CONTEXT: &str = "context";
    /// Operation name, may be empty.
    pub const OPERATION_NAME: &str = "operation_name";
    /// Topic → fingerprint map, JSON object.
    pub const EVENTS: &str = "events";
    /// Unix seconds at registration.
    pub const CREATED_AT: &str = "created_at";
    /// Owning channel id.
    pub const CHANNEL: &str = "channel";
    /// Random token minted per registration; pins a record's identity across
    /// re-registrations of the same id.
    pub const TOKEN: &str = "token";
}

/// One `(topic, fingerprint)` pair a subscription listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    /// Coarse topic, e.g. `:postUpdated:id:1`.
    pub topic: String,
    /// Cache key under that topic; equal fingerprints evaluate identically.
    pub fingerprint: String,
}

impl EventKey {
    /// Builds an event key.
    pub fn new(topic: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self { topic: topic.into(), fingerprint: fingerprint.into() }
    }
}

/// Input to [`Registry::register`](crate::core::registry::Registry::register).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewSubscription {
    /// Caller-supplied id, honoured only when `use_client_provided_uniq_id` is on.
    pub id: Option<String>,
    /// Query text.
    pub query_string: String,
    /// Opaque context blob, produced by a [`ContextCodec`].
    pub context: String,
    /// Query variables.
    pub variables: Value,
    /// Operation name.
    pub operation_name: Option<String>,
    /// Every `(topic, fingerprint)` the subscription listens on.
    pub events: Vec<EventKey>,
    /// Owning channel; registration fails without it.
    pub channel_id: Option<String>,
    /// TTL for the record and the channel entry; falls back to the configured expiration.
    pub ttl_seconds: Option<u64>,
}

impl NewSubscription {
    /// A registration for `query_string` owned by `channel_id`.
    pub fn new(query_string: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            query_string: query_string.into(),
            channel_id: Some(channel_id.into()),
            variables: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    /// Adds a `(topic, fingerprint)` pair.
    pub fn with_event(mut self, topic: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        self.events.push(EventKey::new(topic, fingerprint));
        self
    }

    /// Requests a specific subscription id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the variables.
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Sets the operation name.
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Sets the TTL.
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    /// Encodes `context` with `codec` and stores the blob.
    pub fn with_context<C: ContextCodec>(mut self, codec: &C, context: &C::Context) -> FanoutResult<Self> {
        self.context = codec.encode(context)?;
        Ok(self)
    }
}

/// The durable representation of one live subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    /// Subscription id.
    pub id: String,
    /// Query text.
    pub query_string: String,
    /// Opaque context blob.
    pub context: String,
    /// Query variables.
    pub variables: Value,
    /// Operation name, if any.
    pub operation_name: Option<String>,
    /// Topic → fingerprint.
    pub events: BTreeMap<String, String>,
    /// Unix seconds at registration, if recorded.
    pub created_at: Option<i64>,
    /// Owning channel, if recorded.
    pub channel_id: Option<String>,
}

impl SubscriptionRecord {
    /// Hash fields to persist for `sub`, owned by `channel_id`, indexed under `events`.
    pub(crate) fn to_fields(
        sub: &NewSubscription,
        channel_id: &str,
        events: &BTreeMap<String, String>,
        created_at: i64,
    ) -> FanoutResult<Vec<(String, String)>> {
        Ok(vec![
            (fields::QUERY_STRING.to_string(), sub.query_string.clone()),
            (fields::VARIABLES.to_string(), serde_json::to_string(&sub.variables)?),
            (fields::CONTEXT.to_string(), sub.context.clone()),
            (fields::OPERATION_NAME.to_string(), sub.operation_name.clone().unwrap_or_default()),
            (fields::EVENTS.to_string(), serde_json::to_string(&events)?),
            (fields::CREATED_AT.to_string(), created_at.to_string()),
            (fields::CHANNEL.to_string(), channel_id.to_string()),
        ])
    }

    /// Rebuilds a record from its hash. `None` if the hash is empty, lacks the
    /// query text, or carries undecodable JSON fields.
    pub fn from_fields(id: &str, mut raw: HashMap<String, String>) -> Option<Self> {
        let query_string = raw.remove(fields::QUERY_STRING).filter(|q| !q.is_empty())?;
        let variables = match raw.remove(fields::VARIABLES) {
            Some(v) if !v.is_empty() => serde_json::from_str(&v).ok()?,
            _ => Value::Object(Default::default()),
        };
        let events = match raw.remove(fields::EVENTS) {
            Some(e) if !e.is_empty() => serde_json::from_str(&e).ok()?,
            _ => BTreeMap::new(),
        };
        Some(Self {
            id: id.to_string(),
            query_string,
            context: raw.remove(fields::CONTEXT).unwrap_or_default(),
            variables,
            operation_name: raw.remove(fields::OPERATION_NAME).filter(|n| !n.is_empty()),
            events,
            created_at: raw.remove(fields::CREATED_AT).and_then(|c| c.parse().ok()),
            channel_id: raw.remove(fields::CHANNEL).filter(|c| !c.is_empty()),
        })
    }

    /// Topic → fingerprint map of `events`; a repeated topic keeps its last fingerprint.
    pub(crate) fn event_map(events: &[EventKey]) -> BTreeMap<String, String> {
        events.iter().map(|e| (e.topic.clone(), e.fingerprint.clone())).collect()
    }

    /// The `(topic, fingerprint)` pairs this record is indexed under.
    pub fn event_keys(&self) -> impl Iterator<Item = EventKey> + '_ {
        self.events.iter().map(|(t, f)| EventKey::new(t.clone(), f.clone()))
    }
}

/// A producer's report that a topic changed.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    /// Event name, e.g. `postUpdated`.
    pub name: String,
    /// Trigger arguments.
    pub arguments: Value,
    /// The changed object handed to the evaluator.
    pub object: Value,
    /// Topic derived from `name` and `arguments`.
    pub topic: String,
}

impl TriggerEvent {
    /// Builds an event, deriving its topic.
    pub fn new(name: impl Into<String>, arguments: Value, object: Value) -> Self {
        let name = name.into();
        let topic = topic_for(&name, &arguments);
        Self { name, arguments, object, topic }
    }
}

/// Derives a topic: `:<name>` followed by `:<key>:<value>` for every argument
/// in key order. String values appear bare, everything else as compact JSON.
pub fn topic_for(name: &str, arguments: &Value) -> String {
    let mut topic = format!(":{name}");
    if let Value::Object(map) = arguments {
        let sorted: BTreeMap<&String, &Value> = map.iter().collect();
        for (key, value) in sorted {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            topic.push(':');
            topic.push_str(key);
            topic.push(':');
            topic.push_str(&rendered);
        }
    }
    topic
}

/// The event-name segment of a topic built by [`topic_for`].
pub fn subscription_name(topic: &str) -> &str {
    topic.split(':').nth(1).unwrap_or(topic)
}

/// Encodes application context into the opaque blob stored with a
/// subscription, and back. The core never looks inside.
pub trait ContextCodec: Send + Sync {
    /// Application context type.
    type Context;

    /// Context → blob.
    fn encode(&self, context: &Self::Context) -> FanoutResult<String>;

    /// Blob → context.
    fn decode(&self, blob: &str) -> FanoutResult<Self::Context>;
}

/// [`ContextCodec`] for any serde type, using JSON.
pub struct JsonContextCodec<C> {
    _marker: PhantomData<fn() -> C>,
}

impl<C> JsonContextCodec<C> {
    /// A JSON codec for `C`.
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<C> Default for JsonContextCodec<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Serialize + DeserializeOwned> ContextCodec for JsonContextCodec<C> {
    type Context = C;

    fn encode(&self, context: &C) -> FanoutResult<String> {
        Ok(serde_json::to_string(context)?)
    }

    fn decode(&self, blob: &str) -> FanoutResult<C> {
        Ok(serde_json::from_str(blob)?)
    }
}
