//! Delivers changes as JSON POSTs to each recipient's webhook URL.

use crate::poller::{Change, DeliveryError, NotificationSink, Recipient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WebhookPayload {
    /// Human readable message.
    pub content: String,
    pub subject_id: String,
    pub change_id: String,
    pub watermark: String,
    pub payload: serde_json::Value,
}

impl WebhookPayload {
    pub fn from_change(change: &Change) -> Self {
        let content = match &change.previous {
            Some(previous) => format!(
                "{} updated: {} (was {})",
                change.subject_label,
                change.current.encode(),
                previous.encode()
            ),
            None => format!("{} updated: {}", change.subject_label, change.current.encode()),
        };
        Self {
            content,
            subject_id: change.subject_id.clone(),
            change_id: change.change_id.clone(),
            watermark: change.current.encode(),
            payload: change.payload.clone(),
        }
    }
}

pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

fn parse_address(address: &str) -> Result<Url, DeliveryError> {
    let url = Url::parse(address).map_err(|e| {
        DeliveryError::RecipientUnreachable(format!("invalid address {:?}: {}", address, e))
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(DeliveryError::RecipientUnreachable(format!(
            "unsupported address scheme {}",
            scheme
        ))),
    }
}

fn classify_status(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(DeliveryError::Transient(format!("status {}", status)))
    } else {
        Err(DeliveryError::RecipientUnreachable(format!("status {}", status)))
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, recipient: &Recipient, change: &Change) -> Result<(), DeliveryError> {
        let url = parse_address(&recipient.address)?;
        let body = WebhookPayload::from_change(change);

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request failed: {}", e)))?;

        classify_status(response.status())
    }
}
