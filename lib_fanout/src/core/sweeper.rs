//! # Reclamation Sweeper
//!
//! Out-of-band garbage collection for the index, in four idempotent passes:
//!
//! 1. **Channels** idle longer than the expiration threshold are deleted.
//! 2. **Subscription records** older than the threshold are deleted (index
//!    entries are left to passes 3 and 4).
//! 3. **Fingerprint membership**: ids whose record no longer exists are removed.
//! 4. **Topic index**: fingerprints with a refcount `<= 0`, or with no
//!    Fingerprint Index entry left, are removed.
//!
//! Passes 1 and 2 need `subscription_expiration_seconds`; 3 and 4 always run.
//! Every scan is cursor based with a bounded batch, and every removal of an
//! orphan is guarded on the orphan still being absent, so a sweep can be
//! interrupted, re-run, or run next to live traffic.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::configs::config_fanout::{FanoutConfig, KeySpace};
use crate::connections::store::{Guard, KvStore, Transaction};
use crate::errors::FanoutResult;
use crate::utils::now_unix;

/// Entries removed by one sweep, per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Channel Index entries deleted for age.
    pub channels: usize,
    /// Subscription Records deleted for age.
    pub subscriptions: usize,
    /// Orphaned ids removed from Fingerprint Index entries.
    pub fingerprint_members: usize,
    /// Fingerprints removed from Topic Index entries.
    pub topic_fingerprints: usize,
    /// Created-at entries whose key had already vanished.
    pub created_at_entries: usize,
}

impl SweepReport {
    /// Total entries removed.
    pub fn total(&self) -> usize {
        self.channels
            + self.subscriptions
            + self.fingerprint_members
            + self.topic_fingerprints
            + self.created_at_entries
    }
}

#[derive(Clone, Copy)]
enum Family {
    Channel,
    Subscription,
}

/// Batch reclamation over the shared store.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    expiration_seconds: Option<u64>,
    use_object_idletime: bool,
    prune_created_at: bool,
    scan_count: usize,
}

impl Sweeper {
    /// A sweeper over `store`, configured by `config`.
    pub fn new(store: Arc<dyn KvStore>, config: &FanoutConfig) -> Self {
        Self {
            store,
            keys: config.keys(),
            expiration_seconds: config.subscription_expiration_seconds,
            use_object_idletime: config.use_object_idletime,
            prune_created_at: config.prune_created_at,
            scan_count: config.scan_count.max(1),
        }
    }

    /// Runs every pass against the current time.
    pub async fn sweep(&self) -> FanoutResult<SweepReport> {
        self.sweep_at(now_unix()).await
    }

    /// Runs every pass, judging age against `now` (Unix seconds).
    pub async fn sweep_at(&self, now: i64) -> FanoutResult<SweepReport> {
        let mut report = SweepReport::default();

        if let Some(expiration) = self.expiration_seconds {
            report.channels = self.expire(Family::Channel, now, expiration).await?;
            report.subscriptions = self.expire(Family::Subscription, now, expiration).await?;
        }
        report.fingerprint_members = self.clean_fingerprint_subscriptions().await?;
        report.topic_fingerprints = self.clean_topic_fingerprints().await?;
        if self.prune_created_at {
            report.created_at_entries = self.prune_created_at_entries().await?;
        }

        info!(
            "Sweep removed {} channel(s), {} subscription(s), {} member(s), {} fingerprint(s), {} created-at entr(ies)",
            report.channels,
            report.subscriptions,
            report.fingerprint_members,
            report.topic_fingerprints,
            report.created_at_entries
        );
        Ok(report)
    }

    /// Passes 1 and 2: delete keys of `family` older than `expiration`.
    async fn expire(&self, family: Family, now: i64, expiration: u64) -> FanoutResult<usize> {
        if self.use_object_idletime {
            self.expire_by_idletime(family, expiration).await
        } else {
            self.expire_by_created_at(family, now, expiration).await
        }
    }

    async fn expire_by_idletime(&self, family: Family, expiration: u64) -> FanoutResult<usize> {
        let pattern = match family {
            Family::Channel => self.keys.channel_pattern(),
            Family::Subscription => self.keys.subscription_pattern(),
        };

        let mut removed = 0;
        let mut cursor = 0;
        loop {
            let page = self.store.scan(&pattern, cursor, self.scan_count).await?;
            for key in page.items {
                // Gone since the scan saw it: nothing to do.
                let Some(idle) = self.store.idle_time(&key).await? else {
                    continue;
                };
                if idle > expiration {
                    self.delete_aged(&key).await?;
                    removed += 1;
                }
            }
            if page.cursor == 0 {
                return Ok(removed);
            }
            cursor = page.cursor;
        }
    }

    async fn expire_by_created_at(&self, family: Family, now: i64, expiration: u64) -> FanoutResult<usize> {
        let created_at_key = self.keys.created_at_key();
        let threshold = i64::try_from(expiration).unwrap_or(i64::MAX);

        let mut removed = 0;
        let mut cursor = 0;
        loop {
            let page = self.store.hscan(created_at_key, cursor, self.scan_count).await?;
            for (key, created_at) in page.items {
                let in_family = match family {
                    Family::Channel => self.keys.is_channel_key(&key),
                    Family::Subscription => self.keys.is_subscription_key(&key),
                };
                if !in_family {
                    continue;
                }
                let Ok(created_at) = created_at.parse::<i64>() else {
                    debug!("Unreadable created-at '{}' for '{}'", created_at, key);
                    continue;
                };
                if now.saturating_sub(created_at) > threshold {
                    self.delete_aged(&key).await?;
                    removed += 1;
                }
            }
            if page.cursor == 0 {
                return Ok(removed);
            }
            cursor = page.cursor;
        }
    }

    async fn delete_aged(&self, key: &str) -> FanoutResult<()> {
        let mut tx = Transaction::new();
        tx.del(key).hdel(self.keys.created_at_key(), key);
        self.store.exec(tx).await?;
        debug!("Expired '{}'", key);
        Ok(())
    }

    /// Pass 3: drop member ids whose Subscription Record is gone.
    pub async fn clean_fingerprint_subscriptions(&self) -> FanoutResult<usize> {
        let pattern = self.keys.subscriptions_pattern();

        let mut removed = 0;
        let mut cursor = 0;
        loop {
            let page = self.store.scan(&pattern, cursor, self.scan_count).await?;
            for key in page.items {
                for id in self.store.smembers(&key).await? {
                    let subscription_key = self.keys.subscription_key(&id);
                    if self.store.exists(&subscription_key).await? {
                        continue;
                    }
                    let mut tx = Transaction::new().guarded(Guard::Absent(subscription_key));
                    tx.srem(key.clone(), id.clone());
                    if self.store.exec(tx).await? {
                        debug!("Removed orphan '{}' from '{}'", id, key);
                        removed += 1;
                    }
                }
            }
            if page.cursor == 0 {
                return Ok(removed);
            }
            cursor = page.cursor;
        }
    }

    /// Pass 4: drop fingerprints with a non-positive refcount or no members.
    pub async fn clean_topic_fingerprints(&self) -> FanoutResult<usize> {
        let pattern = self.keys.fingerprints_pattern();

        let mut removed = 0;
        let mut cursor = 0;
        loop {
            let page = self.store.scan(&pattern, cursor, self.scan_count).await?;
            for key in page.items {
                let fingerprints = self.store.zrange_with_scores(&key).await?;

                let exhausted = fingerprints.iter().filter(|(_, score)| *score <= 0.0).count();
                if exhausted > 0 {
                    let mut tx = Transaction::new();
                    tx.zremrangebyscore(key.clone(), 0.0);
                    self.store.exec(tx).await?;
                    removed += exhausted;
                }

                for (fingerprint, _) in fingerprints.into_iter().filter(|(_, score)| *score > 0.0) {
                    let subscriptions_key = self.keys.subscriptions_key(&fingerprint);
                    if self.store.exists(&subscriptions_key).await? {
                        continue;
                    }
                    let mut tx = Transaction::new().guarded(Guard::Absent(subscriptions_key));
                    tx.zrem(key.clone(), fingerprint.clone());
                    if self.store.exec(tx).await? {
                        debug!("Removed empty fingerprint '{}' from '{}'", fingerprint, key);
                        removed += 1;
                    }
                }
            }
            if page.cursor == 0 {
                return Ok(removed);
            }
            cursor = page.cursor;
        }
    }

    /// Drops created-at entries whose key no longer exists.
    pub async fn prune_created_at_entries(&self) -> FanoutResult<usize> {
        let created_at_key = self.keys.created_at_key();

        let mut removed = 0;
        let mut cursor = 0;
        loop {
            let page = self.store.hscan(created_at_key, cursor, self.scan_count).await?;
            for (key, _) in page.items {
                if self.store.exists(&key).await? {
                    continue;
                }
                let mut tx = Transaction::new().guarded(Guard::Absent(key.clone()));
                tx.hdel(created_at_key, key);
                if self.store.exec(tx).await? {
                    removed += 1;
                }
            }
            if page.cursor == 0 {
                return Ok(removed);
            }
            cursor = page.cursor;
        }
    }
}
