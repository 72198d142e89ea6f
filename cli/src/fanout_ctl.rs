//! # Fan-Out Control
//!
//! Operational entrypoints over a Redis-backed subscription index:
//!
//! - `trigger`: fan an event out to its topic and print fingerprint → group size.
//! - `stats`: print key counts per index family, optionally per subscription name.
//! - `sweep`: reclaim stale entries once, or on a cron schedule until Ctrl-C.
//!
//! Configuration is layered: defaults, then the JSON config file, then
//! `FANOUT_*` environment variables, then flags.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use static_init::dynamic;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use lib_fanout::errors::FanoutResult;
use lib_fanout::loggers::setup_logging;
use lib_fanout::{
    ConfigLayer, Evaluator, FanoutConfig, FanoutEngine, KvStore, RedisBroadcaster, RedisStore,
    Registry, Stats, SubscriptionRecord, Sweeper, TriggerEvent,
};

// load .env files before anything else
#[dynamic]
static DOTENV_INIT: () = {
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };

    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
};

/// Command-line arguments for the fan-out controller.
#[derive(Parser, Debug)]
#[command(author, version, about = "Trigger, inspect and sweep a store-backed subscription index", long_about = None)]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

/// Settings shared by every subcommand. Flags win over environment variables.
#[derive(clap::Args, Debug)]
struct ConfigArgs {
    /// JSON config file.
    #[arg(long, env = "FANOUT_CONFIG_PATH", default_value = "fanout.conf", global = true)]
    config_path: PathBuf,

    /// Redis URL.
    #[arg(long, env = "FANOUT_REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Prefix of every persisted key.
    #[arg(long, env = "FANOUT_REDIS_PREFIX", global = true)]
    redis_prefix: Option<String>,

    /// Subscription TTL and sweeper age threshold, in seconds.
    #[arg(long, env = "FANOUT_SUBSCRIPTION_EXPIRATION_SECONDS", global = true)]
    subscription_expiration_seconds: Option<u64>,

    /// Measure age with OBJECT IDLETIME instead of the created-at hash.
    #[arg(long, env = "FANOUT_USE_OBJECT_IDLETIME", global = true)]
    use_object_idletime: Option<bool>,

    /// Honour caller-supplied subscription ids.
    #[arg(long, env = "FANOUT_USE_CLIENT_PROVIDED_UNIQ_ID", global = true)]
    use_client_provided_uniq_id: Option<bool>,

    /// Drop created-at entries whose key is gone.
    #[arg(long, env = "FANOUT_PRUNE_CREATED_AT", global = true)]
    prune_created_at: Option<bool>,

    /// Keys requested per scan round-trip.
    #[arg(long, env = "FANOUT_SCAN_COUNT", global = true)]
    scan_count: Option<usize>,

    /// Pub/sub channel for deliveries.
    #[arg(long, env = "FANOUT_BROADCAST_CHANNEL", global = true)]
    broadcast_channel: Option<String>,

    /// Directory for log files.
    #[arg(long, env = "FANOUT_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "FANOUT_LOG_LEVEL", global = true)]
    log_level: Option<String>,
}

impl ConfigArgs {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            redis_url: self.redis_url.clone(),
            redis_prefix: self.redis_prefix.clone(),
            subscription_expiration_seconds: self.subscription_expiration_seconds,
            use_object_idletime: self.use_object_idletime,
            use_client_provided_uniq_id: self.use_client_provided_uniq_id,
            prune_created_at: self.prune_created_at,
            scan_count: self.scan_count,
            broadcast_channel: self.broadcast_channel.clone(),
            log_dir: self.log_dir.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fan an event out to every fingerprint group of its topic.
    Trigger {
        /// Event name, e.g. postUpdated.
        #[arg(long)]
        event: String,
        /// Trigger arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        arguments: String,
        /// The changed object as JSON.
        #[arg(long, default_value = "null")]
        object: String,
    },
    /// Print key counts per index family.
    Stats {
        /// Also break fingerprint counts down per subscription name.
        #[arg(long)]
        include_subscriptions: bool,
    },
    /// Reclaim expired and orphaned entries.
    Sweep {
        /// Cron expression (with seconds) to sweep on until Ctrl-C.
        #[arg(long)]
        schedule: Option<String>,
    },
}

/// Delivers the triggering object as the result of every subscription.
struct PassThroughEvaluator;

#[async_trait]
impl Evaluator for PassThroughEvaluator {
    async fn evaluate(&self, _subscription: &SubscriptionRecord, event: &TriggerEvent) -> FanoutResult<Option<Value>> {
        Ok(Some(json!({ "result": { "data": event.object.clone() }, "more": true })))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = FanoutConfig::load(&args.config.config_path, args.config.layer())
        .context("Failed to load configuration")?;
    let _guard = setup_logging(&config.log_dir, &config.log_level).context("Failed to set up logging")?;

    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
    info!("Connected to {} with prefix '{}'", config.redis_url, config.redis_prefix);

    match args.command {
        Command::Trigger { event, arguments, object } => {
            let arguments: Value = serde_json::from_str(&arguments).context("--arguments is not valid JSON")?;
            let object: Value = serde_json::from_str(&object).context("--object is not valid JSON")?;

            let delivery = Arc::new(RedisBroadcaster::new(store.connection(), config.broadcast_channel.clone()));
            let registry = Registry::new(Arc::new(store), &config);
            let engine = FanoutEngine::new(registry, Arc::new(PassThroughEvaluator), delivery);

            let report = engine.trigger(&event, arguments, object).await.context("Trigger failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats { include_subscriptions } => {
            let report = Stats::new(Arc::new(store), &config)
                .collect(include_subscriptions)
                .await
                .context("Stats collection failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Sweep { schedule } => {
            let store: Arc<dyn KvStore> = Arc::new(store);
            let sweeper = Sweeper::new(store, &config);
            match schedule {
                None => {
                    let report = sweeper.sweep().await.context("Sweep failed")?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                Some(schedule) => run_scheduled(sweeper, &schedule).await?,
            }
        }
    }

    Ok(())
}

/// Sweeps on `schedule` until Ctrl-C.
async fn run_scheduled(sweeper: Sweeper, schedule: &str) -> Result<()> {
    let mut scheduler = JobScheduler::new().await.context("Failed to create scheduler")?;

    let job = Job::new_async(schedule, move |uuid, mut l| {
        let sweeper = sweeper.clone();
        Box::pin(async move {
            match sweeper.sweep().await {
                Ok(report) => info!("Scheduled sweep removed {} entr(ies)", report.total()),
                Err(e) => error!("Scheduled sweep failed: {}", e),
            }
            if let Ok(Some(next)) = l.next_tick_for_job(uuid).await {
                info!("Next sweep at {:?}", next);
            }
        })
    })
    .with_context(|| format!("Invalid schedule '{schedule}'"))?;

    scheduler.add(job).await.context("Failed to add sweep job")?;
    scheduler.start().await.context("Failed to start scheduler")?;
    info!("Sweeping on schedule '{}', Ctrl-C to stop", schedule);

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down scheduler");
    scheduler.shutdown().await.context("Failed to stop scheduler")?;
    Ok(())
}
