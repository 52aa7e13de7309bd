//! Generic HTTP/JSON upstream fetcher.
//!
//! GETs the subject's target and reads the watermark at the subject's JSON
//! pointer selector.

use crate::config::UpstreamSettings;
use crate::poller::{FetchError, Observation, TrackedSubject, UpstreamFetcher, Watermark};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

pub struct HttpJsonFetcher {
    client: reqwest::Client,
    base_url: Option<String>,
    default_retry_after: Duration,
}

impl HttpJsonFetcher {
    /// `timeout` bounds each request; the poller applies its own per-attempt
    /// timeout on top.
    pub fn new(settings: &UpstreamSettings, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;

        // Ensure base_url doesn't have trailing slash
        let base_url = settings
            .base_url
            .as_ref()
            .map(|url| url.trim_end_matches('/').to_string());

        Ok(Self {
            client,
            base_url,
            default_retry_after: Duration::from_secs(settings.default_retry_after_secs),
        })
    }

    fn resolve_url(&self, target: &str) -> Result<String, FetchError> {
        if target.starts_with("http://") || target.starts_with("https://") {
            return Ok(target.to_string());
        }
        match &self.base_url {
            Some(base) => Ok(format!("{}/{}", base, target.trim_start_matches('/'))),
            None => Err(FetchError::Fatal(format!(
                "relative target {:?} but no upstream base_url configured",
                target
            ))),
        }
    }

    fn retry_after(&self, headers: &header::HeaderMap) -> Duration {
        headers
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()))
            .unwrap_or(self.default_retry_after)
    }
}

/// `Retry-After` is either delay seconds or an HTTP date. A date in the past
/// means retry right away.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound,
        StatusCode::REQUEST_TIMEOUT => FetchError::Transient(format!("status {}", status)),
        s if s.is_server_error() => FetchError::Transient(format!("status {}", s)),
        s => FetchError::Fatal(format!("unexpected status {}", s)),
    })
}

/// Pull the watermark out of a decoded response body.
fn extract_watermark(subject: &TrackedSubject, body: &Value) -> Result<(Watermark, Value), FetchError> {
    let selected = match subject.selector.as_deref() {
        Some(pointer) if !pointer.is_empty() => body.pointer(pointer).ok_or_else(|| {
            FetchError::Fatal(format!("selector {} not present in response", pointer))
        })?,
        _ => body,
    };

    let raw = match selected {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(FetchError::Fatal(format!(
                "selected value is not a string or number: {}",
                other
            )))
        }
    };

    let watermark = Watermark::parse(subject.kind, &raw).ok_or_else(|| {
        FetchError::Fatal(format!("cannot read {:?} as a {} watermark", raw, subject.kind))
    })?;
    Ok((watermark, selected.clone()))
}

#[async_trait]
impl UpstreamFetcher for HttpJsonFetcher {
    async fn fetch(&self, subject: &TrackedSubject) -> Result<Observation, FetchError> {
        let url = self.resolve_url(&subject.target)?;

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_builder() {
                FetchError::Fatal(format!("invalid request to {}: {}", url, e))
            } else {
                FetchError::Transient(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited(self.retry_after(response.headers())));
        }
        if let Some(error) = classify_status(status) {
            return Err(error);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("undecodable body from {}: {}", url, e)))?;

        let (watermark, selected) = extract_watermark(subject, &body)?;
        Ok(Observation {
            watermark,
            payload: json!({
                "value": selected,
                "source": url,
            }),
        })
    }
}
