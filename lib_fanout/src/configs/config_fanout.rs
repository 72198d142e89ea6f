//! # Fan-out Configuration
//!
//! `FanoutConfig` is built once at the outermost composition point and passed
//! by value into the registry, the engine and the sweeper. Nothing in the core
//! reads the environment or a global.
//!
//! Layering, lowest to highest precedence:
//! 1. built-in defaults ([`FanoutConfig::default`]);
//! 2. a JSON config file (camelCase keys), if present;
//! 3. caller overrides (environment variables and CLI flags, resolved by the binary).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{FanoutError, FanoutResult};

/// Default Redis endpoint.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";
/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "graphql";
/// Default pub/sub channel for broadcasts.
pub const DEFAULT_BROADCAST_CHANNEL: &str = "__anycable__";
/// Default number of keys requested per scan round-trip.
pub const DEFAULT_SCAN_COUNT: usize = 1_000;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutConfig {
    /// Store endpoint.
    pub redis_url: String,
    /// Prefix of every persisted key.
    pub redis_prefix: String,
    /// TTL applied on register when the call gives none, and the sweeper's age
    /// threshold. `None` disables expiration entirely.
    pub subscription_expiration_seconds: Option<u64>,
    /// Measure age with `OBJECT IDLETIME` instead of the created-at hash.
    pub use_object_idletime: bool,
    /// Honour subscription ids supplied by the caller.
    pub use_client_provided_uniq_id: bool,
    /// Let the sweeper drop created-at entries whose key no longer exists.
    pub prune_created_at: bool,
    /// Keys requested per scan round-trip.
    pub scan_count: usize,
    /// Redis pub/sub channel used by the broadcaster.
    pub broadcast_channel: String,
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            redis_prefix: DEFAULT_PREFIX.to_string(),
            subscription_expiration_seconds: None,
            use_object_idletime: true,
            use_client_provided_uniq_id: true,
            prune_created_at: true,
            scan_count: DEFAULT_SCAN_COUNT,
            broadcast_channel: DEFAULT_BROADCAST_CHANNEL.to_string(),
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
        }
    }
}

/// One partial layer of configuration. `Some` fields override lower layers.
/// Each field mirrors the [`FanoutConfig`] field of the same name.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigLayer {
    pub redis_url: Option<String>,
    pub redis_prefix: Option<String>,
    pub subscription_expiration_seconds: Option<u64>,
    pub use_object_idletime: Option<bool>,
    pub use_client_provided_uniq_id: Option<bool>,
    pub prune_created_at: Option<bool>,
    pub scan_count: Option<usize>,
    pub broadcast_channel: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ConfigLayer {
    /// Parses a layer from a JSON config file.
    pub fn from_file(path: &Path) -> FanoutResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| FanoutError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| FanoutError::Config(format!("{}: {}", path.display(), e)))
    }
}

impl FanoutConfig {
    /// Returns a copy of `self` with every `Some` field of `layer` applied.
    pub fn merge(self, layer: ConfigLayer) -> Self {
        Self {
            redis_url: layer.redis_url.unwrap_or(self.redis_url),
            redis_prefix: layer.redis_prefix.unwrap_or(self.redis_prefix),
            subscription_expiration_seconds: layer
                .subscription_expiration_seconds
                .or(self.subscription_expiration_seconds),
            use_object_idletime: layer.use_object_idletime.unwrap_or(self.use_object_idletime),
            use_client_provided_uniq_id: layer
                .use_client_provided_uniq_id
                .unwrap_or(self.use_client_provided_uniq_id),
            prune_created_at: layer.prune_created_at.unwrap_or(self.prune_created_at),
            scan_count: layer.scan_count.unwrap_or(self.scan_count),
            broadcast_channel: layer.broadcast_channel.unwrap_or(self.broadcast_channel),
            log_dir: layer.log_dir.unwrap_or(self.log_dir),
            log_level: layer.log_level.unwrap_or(self.log_level),
        }
    }

    /// Builds the final config: defaults, then `config_path` if the file exists,
    /// then `overrides`.
    pub fn load(config_path: &Path, overrides: ConfigLayer) -> FanoutResult<Self> {
        let mut config = Self::default();

        if config_path.exists() {
            config = config.merge(ConfigLayer::from_file(config_path)?);
        } else {
            info!(
                "Config file not found at {}. Using defaults and environment/CLI variables.",
                config_path.display()
            );
        }

        let config = config.merge(overrides);
        if config.scan_count == 0 {
            return Err(FanoutError::Config("scanCount must be greater than zero".into()));
        }
        Ok(config)
    }

    /// Key layout for this configuration.
    pub fn keys(&self) -> KeySpace {
        KeySpace::new(&self.redis_prefix)
    }
}

/// Persisted key layout.
///
/// | Key | Type |
/// |---|---|
/// | `<prefix>-fingerprints:<topic>` | sorted set, fingerprint → refcount |
/// | `<prefix>-subscriptions:<fingerprint>` | set of subscription ids |
/// | `<prefix>-subscription:<id>` | hash (the subscription record) |
/// | `<prefix>-channel:<channel-id>` | set of subscription ids |
/// | `<prefix>-created-at` | hash, key → Unix seconds |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    fingerprints: String,
    subscriptions: String,
    subscription: String,
    channel: String,
    created_at: String,
}

impl KeySpace {
    /// Builds the layout for `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            fingerprints: format!("{prefix}-fingerprints:"),
            subscriptions: format!("{prefix}-subscriptions:"),
            subscription: format!("{prefix}-subscription:"),
            channel: format!("{prefix}-channel:"),
            created_at: format!("{prefix}-created-at"),
        }
    }

    /// Topic Index key.
    pub fn fingerprints_key(&self, topic: &str) -> String {
        format!("{}{}", self.fingerprints, topic)
    }

    /// Fingerprint Index key.
    pub fn subscriptions_key(&self, fingerprint: &str) -> String {
        format!("{}{}", self.subscriptions, fingerprint)
    }

    /// Subscription Record key.
    pub fn subscription_key(&self, subscription_id: &str) -> String {
        format!("{}{}", self.subscription, subscription_id)
    }

    /// Channel Index key.
    pub fn channel_key(&self, channel_id: &str) -> String {
        format!("{}{}", self.channel, channel_id)
    }

    /// The created-at bookkeeping hash.
    pub fn created_at_key(&self) -> &str {
        &self.created_at
    }

    /// Broadcast address shared by every member of a fingerprint group.
    pub fn group_address(&self, fingerprint: &str) -> String {
        self.subscriptions_key(fingerprint)
    }

    /// Scan pattern matching every Topic Index key.
    pub fn fingerprints_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.fingerprints))
    }

    /// Scan pattern matching every Fingerprint Index key.
    pub fn subscriptions_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.subscriptions))
    }

    /// Scan pattern matching every Subscription Record key.
    pub fn subscription_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.subscription))
    }

    /// Scan pattern matching every Channel Index key.
    pub fn channel_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.channel))
    }

    /// Topic embedded in a Topic Index key.
    pub fn topic_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.fingerprints.as_str())
    }

    /// Fingerprint embedded in a Fingerprint Index key.
    pub fn fingerprint_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.subscriptions.as_str())
    }

    /// Whether `key` is a Subscription Record key.
    pub fn is_subscription_key(&self, key: &str) -> bool {
        key.starts_with(self.subscription.as_str())
    }

    /// Whether `key` is a Channel Index key.
    pub fn is_channel_key(&self, key: &str) -> bool {
        key.starts_with(self.channel.as_str())
    }
}

fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn key_layout_follows_prefix() {
        let keys = KeySpace::new("app");
        assert_eq!(keys.fingerprints_key(":postUpdated:id:1"), "app-fingerprints::postUpdated:id:1");
        assert_eq!(keys.subscriptions_key("fp"), "app-subscriptions:fp");
        assert_eq!(keys.subscription_key("abc"), "app-subscription:abc");
        assert_eq!(keys.channel_key("ch"), "app-channel:ch");
        assert_eq!(keys.created_at_key(), "app-created-at");
        assert_eq!(keys.group_address("fp"), keys.subscriptions_key("fp"));
        assert_eq!(keys.topic_of("app-fingerprints::a:b"), Some(":a:b"));
        assert_eq!(keys.fingerprint_of("app-subscriptions:fp"), Some("fp"));
        assert!(keys.is_subscription_key("app-subscription:x"));
        assert!(!keys.is_subscription_key("app-subscriptions:x"));
    }

    #[test]
    fn patterns_escape_glob_characters() {
        let keys = KeySpace::new("a*b");
        assert_eq!(keys.channel_pattern(), "a\\*b-channel:*");
    }

    #[test]
    fn overrides_win_over_file_and_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "redisPrefix": "from-file", "subscriptionExpirationSeconds": 600, "scanCount": 50 }}"#
        )
        .unwrap();

        let overrides = ConfigLayer {
            scan_count: Some(10),
            use_object_idletime: Some(false),
            ..Default::default()
        };
        let config = FanoutConfig::load(file.path(), overrides).unwrap();

        assert_eq!(config.redis_prefix, "from-file");
        assert_eq!(config.subscription_expiration_seconds, Some(600));
        assert_eq!(config.scan_count, 10);
        assert!(!config.use_object_idletime);
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FanoutConfig::load(&dir.path().join("absent.conf"), ConfigLayer::default()).unwrap();
        assert_eq!(config, FanoutConfig::default());
    }

    #[test]
    fn malformed_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = FanoutConfig::load(file.path(), ConfigLayer::default()).unwrap_err();
        assert!(matches!(err, FanoutError::Config(_)));
    }

    #[test]
    fn zero_scan_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = ConfigLayer { scan_count: Some(0), ..Default::default() };
        assert!(FanoutConfig::load(&dir.path().join("absent.conf"), overrides).is_err());
    }
}
