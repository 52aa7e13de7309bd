use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reconcile_poller::config::{self, AppConfig, RetentionSettings};
use reconcile_poller::metrics;
use reconcile_poller::poller::{DeliveryRecordStore, Poller, PollerContext};
use reconcile_poller::{HttpJsonFetcher, SqlitePollerStore, WebhookSink};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite poller database. Created if missing.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Seconds between reconciliation cycles.
    #[clap(long, default_value_t = 120)]
    pub interval_secs: u64,

    /// Base URL that relative subject targets are resolved against.
    #[clap(long)]
    pub upstream_base_url: Option<String>,

    /// Number of days to retain delivery records. Set to 0 to disable pruning.
    #[clap(long, default_value_t = 30)]
    pub delivery_record_retention_days: u64,

    /// Interval in hours between pruning runs. Only used if retention is enabled.
    #[clap(long, default_value_t = 24)]
    pub prune_interval_hours: u64,

    /// Run a single cycle, print its summary and exit.
    #[clap(long)]
    pub once: bool,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_path: args.db_path.clone(),
            metrics_port: args.metrics_port,
            interval_secs: args.interval_secs,
            upstream_base_url: args.upstream_base_url.clone(),
            delivery_record_retention_days: args.delivery_record_retention_days,
            prune_interval_hours: args.prune_interval_hours,
        }
    }
}

/// Records last attempted before this instant are pruned. `None` when the
/// retention does not fit in a date.
fn prune_cutoff(now: DateTime<Utc>, retention_days: u64) -> Option<DateTime<Utc>> {
    i64::try_from(retention_days)
        .ok()
        .and_then(ChronoDuration::try_days)
        .and_then(|retention| now.checked_sub_signed(retention))
}

fn spawn_pruning_task(
    store: Arc<dyn DeliveryRecordStore>,
    retention: &RetentionSettings,
    shutdown: CancellationToken,
) {
    let retention_days = retention.delivery_record_retention_days;
    let interval_hours = retention.prune_interval_hours;
    info!(
        "Delivery record pruning enabled: retaining {} days, pruning every {} hours",
        retention_days, interval_hours
    );

    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(interval_hours.saturating_mul(60 * 60)));

        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(cutoff) = prune_cutoff(Utc::now(), retention_days) else {
                error!(
                    "Retention of {} days is out of range, skipping pruning",
                    retention_days
                );
                continue;
            };
            match store.prune_delivery_records(cutoff) {
                Ok(count) => {
                    metrics::record_pruned(count);
                    if count > 0 {
                        info!("Pruned {} old delivery records", count);
                    }
                }
                Err(e) => {
                    error!("Failed to prune delivery records: {:#}", e);
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    info!(
        "reconcile-poller {}-{} starting",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration:");
    info!("  db_path: {:?}", app_config.db_path);
    info!("  interval: {}s", app_config.poller.interval_secs);
    info!("  max_concurrency: {}", app_config.poller.max_concurrency);
    info!("  upstream base_url: {:?}", app_config.upstream.base_url);

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!("Opening SQLite poller database at {:?}...", app_config.db_path);
    let store = Arc::new(SqlitePollerStore::new(&app_config.db_path)?);

    let fetcher = Arc::new(HttpJsonFetcher::new(
        &app_config.upstream,
        app_config.poller.fetch_timeout(),
    )?);
    let sink = Arc::new(WebhookSink::new(app_config.poller.delivery_timeout())?);

    let context = PollerContext::with_store(store.clone(), fetcher, sink);
    let poller = Poller::new(context, app_config.poller.clone());

    if cli_args.once {
        let summary = poller.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let shutdown_token = CancellationToken::new();

    if app_config.retention.delivery_record_retention_days > 0 {
        spawn_pruning_task(
            store.clone(),
            &app_config.retention,
            shutdown_token.child_token(),
        );
    }

    poller.start(app_config.poller.interval())?;

    info!("Metrics available at port {}!", app_config.metrics_port);
    tokio::select! {
        result = metrics::run_metrics_server(app_config.metrics_port) => {
            error!("Metrics server stopped: {:?}", result);
            shutdown_token.cancel();
            poller.stop().await;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
            poller.stop().await;
            Ok(())
        }
    }
}
