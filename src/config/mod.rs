mod file_config;

pub use file_config::{FileConfig, PollerConfig, RetentionConfig, UpstreamConfig};

use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub metrics_port: u16,
    pub interval_secs: u64,
    pub upstream_base_url: Option<String>,
    pub delivery_record_retention_days: u64,
    pub prune_interval_hours: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub metrics_port: u16,

    pub poller: PollerSettings,
    pub upstream: UpstreamSettings,
    pub retention: RetentionSettings,
}

/// Longest single backoff accepted from configuration.
const MAX_BACKOFF_SECS: f64 = 24.0 * 60.0 * 60.0;
/// About a century.
const MAX_RETENTION_DAYS: u64 = 36_500;
/// One year.
const MAX_PRUNE_INTERVAL_HOURS: u64 = 24 * 365;

/// Policy knobs of the reconciliation poller.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerSettings {
    pub interval_secs: u64,
    /// Subjects processed in parallel within one cycle.
    pub max_concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub max_fetch_attempts: u32,
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub backoff_multiplier: f64,
    pub jitter_ratio: f64,
    pub max_rate_limit_waits: u32,
    /// Upper bound for a single upstream-directed wait. A longer `Retry-After`
    /// defers the subject to a later cycle instead.
    pub max_rate_limit_wait_secs: u64,
    /// Attempts per (subject, change, recipient) across cycles.
    pub max_delivery_attempts: u32,
    pub delivery_timeout_secs: u64,
    /// Notify on the very first watermark seen for a subject, instead of
    /// storing it silently as a baseline.
    pub announce_first_observation: bool,
}

impl PollerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("poller.interval_secs must be greater than zero");
        }
        if self.max_concurrency == 0 {
            bail!("poller.max_concurrency must be greater than zero");
        }
        if self.fetch_timeout_secs == 0 || self.delivery_timeout_secs == 0 {
            bail!("poller timeouts must be greater than zero");
        }
        if self.max_fetch_attempts == 0 {
            bail!("poller.max_fetch_attempts must be greater than zero");
        }
        if self.max_delivery_attempts == 0 {
            bail!("poller.max_delivery_attempts must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            bail!(
                "poller.jitter_ratio must be within [0, 1], got {}",
                self.jitter_ratio
            );
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            bail!(
                "poller.backoff_multiplier must be a finite number of at least 1, got {}",
                self.backoff_multiplier
            );
        }
        for (name, secs) in [
            ("initial_backoff_secs", self.initial_backoff_secs),
            ("max_backoff_secs", self.max_backoff_secs),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() || secs > MAX_BACKOFF_SECS {
                bail!(
                    "poller.{} must be between 0 and {} seconds, got {}",
                    name,
                    MAX_BACKOFF_SECS,
                    secs
                );
            }
        }
        if self.max_backoff_secs < self.initial_backoff_secs {
            bail!(
                "poller backoff must satisfy initial_backoff_secs <= max_backoff_secs, got {} and {}",
                self.initial_backoff_secs,
                self.max_backoff_secs
            );
        }
        if self.max_rate_limit_wait_secs == 0 {
            bail!("poller.max_rate_limit_wait_secs must be greater than zero");
        }
        Ok(())
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            max_concurrency: 5,
            fetch_timeout_secs: 10,
            max_fetch_attempts: 3,
            initial_backoff_secs: 2.0,
            max_backoff_secs: 60.0,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
            max_rate_limit_waits: 5,
            max_rate_limit_wait_secs: 300,
            max_delivery_attempts: 3,
            delivery_timeout_secs: 10,
            announce_first_observation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSettings {
    pub base_url: Option<String>,
    pub user_agent: String,
    /// Delay used when a 429 response carries no usable Retry-After header.
    pub default_retry_after_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            user_agent: format!("reconcile-poller/{}", env!("CARGO_PKG_VERSION")),
            default_retry_after_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionSettings {
    /// 0 disables pruning.
    pub delivery_record_retention_days: u64,
    pub prune_interval_hours: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            delivery_record_retention_days: 30,
            prune_interval_hours: 24,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let defaults = PollerSettings::default();
        let p = file.poller.unwrap_or_default();
        let poller = PollerSettings {
            interval_secs: p.interval_secs.unwrap_or(cli.interval_secs),
            max_concurrency: p.max_concurrency.unwrap_or(defaults.max_concurrency),
            fetch_timeout_secs: p.fetch_timeout_secs.unwrap_or(defaults.fetch_timeout_secs),
            max_fetch_attempts: p.max_fetch_attempts.unwrap_or(defaults.max_fetch_attempts),
            initial_backoff_secs: p
                .initial_backoff_secs
                .unwrap_or(defaults.initial_backoff_secs),
            max_backoff_secs: p.max_backoff_secs.unwrap_or(defaults.max_backoff_secs),
            backoff_multiplier: p.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            jitter_ratio: p.jitter_ratio.unwrap_or(defaults.jitter_ratio),
            max_rate_limit_waits: p
                .max_rate_limit_waits
                .unwrap_or(defaults.max_rate_limit_waits),
            max_rate_limit_wait_secs: p
                .max_rate_limit_wait_secs
                .unwrap_or(defaults.max_rate_limit_wait_secs),
            max_delivery_attempts: p
                .max_delivery_attempts
                .unwrap_or(defaults.max_delivery_attempts),
            delivery_timeout_secs: p
                .delivery_timeout_secs
                .unwrap_or(defaults.delivery_timeout_secs),
            announce_first_observation: p
                .announce_first_observation
                .unwrap_or(defaults.announce_first_observation),
        };
        poller.validate()?;

        let upstream_defaults = UpstreamSettings::default();
        let u = file.upstream.unwrap_or_default();
        let upstream = UpstreamSettings {
            base_url: u.base_url.or_else(|| cli.upstream_base_url.clone()),
            user_agent: u.user_agent.unwrap_or(upstream_defaults.user_agent),
            default_retry_after_secs: u
                .default_retry_after_secs
                .unwrap_or(upstream_defaults.default_retry_after_secs),
        };

        let r = file.retention.unwrap_or_default();
        let retention = RetentionSettings {
            delivery_record_retention_days: r
                .delivery_record_retention_days
                .unwrap_or(cli.delivery_record_retention_days),
            prune_interval_hours: r.prune_interval_hours.unwrap_or(cli.prune_interval_hours),
        };
        if retention.delivery_record_retention_days > MAX_RETENTION_DAYS {
            bail!(
                "retention.delivery_record_retention_days must be at most {}, got {}",
                MAX_RETENTION_DAYS,
                retention.delivery_record_retention_days
            );
        }
        if retention.delivery_record_retention_days > 0
            && !(1..=MAX_PRUNE_INTERVAL_HOURS).contains(&retention.prune_interval_hours)
        {
            bail!(
                "retention.prune_interval_hours must be between 1 and {} when pruning is enabled, got {}",
                MAX_PRUNE_INTERVAL_HOURS,
                retention.prune_interval_hours
            );
        }

        Ok(Self {
            db_path,
            metrics_port,
            poller,
            upstream,
            retention,
        })
    }
}
