//! Collaborator interfaces the poller depends on.
//!
//! Stores are synchronous and return `anyhow::Result`; upstream fetching and
//! notification delivery are async and return typed failures the poller
//! reacts to.

use super::models::{
    Change, DeliveryOutcome, DeliveryRecord, Observation, Recipient, TrackedSubject, Watermark,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Read access to the tracked subjects plus the watermark and missing flag.
pub trait SubjectStore: Send + Sync {
    fn list_subjects(&self) -> Result<Vec<TrackedSubject>>;

    fn get_watermark(&self, subject_id: &str) -> Result<Option<Watermark>>;

    /// Store `watermark` unless it would move the subject's watermark backwards.
    ///
    /// Returns whether the stored value changed.
    fn set_watermark(&self, subject_id: &str, watermark: &Watermark) -> Result<bool>;

    /// Returns true when the subject was not already flagged.
    fn mark_missing(&self, subject_id: &str) -> Result<bool>;

    fn clear_missing(&self, subject_id: &str) -> Result<()>;
}

pub trait RecipientStore: Send + Sync {
    /// All recipients subscribed to the subject, including opted-out ones.
    fn recipients_for(&self, subject_id: &str) -> Result<Vec<Recipient>>;
}

pub trait DeliveryRecordStore: Send + Sync {
    fn has_succeeded(&self, subject_id: &str, change_id: &str, recipient_id: &str)
        -> Result<bool>;

    fn get_delivery(
        &self,
        subject_id: &str,
        change_id: &str,
        recipient_id: &str,
    ) -> Result<Option<DeliveryRecord>>;

    /// Record an attempt outcome, incrementing the attempt counter.
    ///
    /// A record that already succeeded is left untouched.
    fn record(
        &self,
        subject_id: &str,
        change_id: &str,
        recipient_id: &str,
        outcome: DeliveryOutcome,
        error: Option<&str>,
    ) -> Result<()>;

    /// Delete records whose last attempt is older than `before`. Returns the count removed.
    fn prune_delivery_records(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Failure modes of an upstream fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The upstream says the entity does not exist.
    NotFound,
    /// The upstream asked us to come back after the given delay.
    RateLimited(Duration),
    Transient(String),
    Fatal(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::RateLimited(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchError::NotFound => "not_found",
            FetchError::RateLimited(_) => "rate_limited",
            FetchError::Transient(_) => "transient",
            FetchError::Fatal(_) => "fatal",
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::NotFound => write!(f, "Upstream entity not found"),
            FetchError::RateLimited(after) => {
                write!(f, "Rate limited, retry after {}s", after.as_secs())
            }
            FetchError::Transient(msg) => write!(f, "Transient upstream error: {}", msg),
            FetchError::Fatal(msg) => write!(f, "Upstream error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// Failure modes of a single notification delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The recipient cannot be reached at its address; retrying will not help.
    RecipientUnreachable(String),
    Transient(String),
}

impl DeliveryError {
    pub fn outcome(&self) -> DeliveryOutcome {
        match self {
            DeliveryError::RecipientUnreachable(_) => DeliveryOutcome::RecipientUnreachable,
            DeliveryError::Transient(_) => DeliveryOutcome::TransientError,
        }
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::RecipientUnreachable(msg) => write!(f, "Recipient unreachable: {}", msg),
            DeliveryError::Transient(msg) => write!(f, "Delivery failed: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {}

#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch(&self, subject: &TrackedSubject) -> Result<Observation, FetchError>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, change: &Change) -> Result<(), DeliveryError>;
}
