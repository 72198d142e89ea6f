//! Read-only counts over the persisted layout, gathered with bounded cursor scans.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::configs::config_fanout::{FanoutConfig, KeySpace};
use crate::connections::store::KvStore;
use crate::core::model::subscription_name;
use crate::errors::FanoutResult;

/// Number of keys per index family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsTotals {
    /// Subscription Records.
    pub subscription: usize,
    /// Topic Index keys.
    pub fingerprints: usize,
    /// Fingerprint Index keys.
    pub subscriptions: usize,
    /// Channel Index keys.
    pub channel: usize,
}

/// Output of [`Stats::collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    /// Key counts per family.
    pub total: StatsTotals,
    /// Fingerprint count per subscription name, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<BTreeMap<String, u64>>,
}

/// Stats entrypoint.
#[derive(Clone)]
pub struct Stats {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    scan_count: usize,
}

impl Stats {
    /// Stats over `store`, scanning `config.scan_count` keys per round-trip.
    pub fn new(store: Arc<dyn KvStore>, config: &FanoutConfig) -> Self {
        Self { store, keys: config.keys(), scan_count: config.scan_count.max(1) }
    }

    /// Overrides the scan batch size.
    pub fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count.max(1);
        self
    }

    /// Counts every family, plus the per-name breakdown when asked.
    pub async fn collect(&self, include_subscriptions: bool) -> FanoutResult<StatsReport> {
        let topic_keys = self.scan_keys(&self.keys.fingerprints_pattern()).await?;

        let total = StatsTotals {
            subscription: self.scan_keys(&self.keys.subscription_pattern()).await?.len(),
            fingerprints: topic_keys.len(),
            subscriptions: self.scan_keys(&self.keys.subscriptions_pattern()).await?.len(),
            channel: self.scan_keys(&self.keys.channel_pattern()).await?.len(),
        };

        let subscriptions = if include_subscriptions {
            let mut by_name = BTreeMap::new();
            for key in &topic_keys {
                let Some(topic) = self.keys.topic_of(key) else {
                    continue;
                };
                let count = self.store.zcard(key).await?;
                *by_name.entry(subscription_name(topic).to_string()).or_insert(0) += count;
            }
            Some(by_name)
        } else {
            None
        };

        Ok(StatsReport { total, subscriptions })
    }

    async fn scan_keys(&self, pattern: &str) -> FanoutResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.store.scan(pattern, cursor, self.scan_count).await?;
            keys.extend(page.items);
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        // Redis may return a key more than once across pages.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}
