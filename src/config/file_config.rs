use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub metrics_port: Option<u16>,

    // Sections
    pub poller: Option<PollerConfig>,
    pub upstream: Option<UpstreamConfig>,
    pub retention: Option<RetentionConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub fetch_timeout_secs: Option<u64>,
    pub max_fetch_attempts: Option<u32>,
    pub initial_backoff_secs: Option<f64>,
    pub max_backoff_secs: Option<f64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_ratio: Option<f64>,
    pub max_rate_limit_waits: Option<u32>,
    pub max_rate_limit_wait_secs: Option<u64>,
    pub max_delivery_attempts: Option<u32>,
    pub delivery_timeout_secs: Option<u64>,
    pub announce_first_observation: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub default_retry_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    pub delivery_record_retention_days: Option<u64>,
    pub prune_interval_hours: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
