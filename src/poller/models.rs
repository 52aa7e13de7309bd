//! Data models shared by the poller and its capabilities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Watermarks
// =============================================================================

/// Defines how a subject's watermarks are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkKind {
    /// Integer value, advances only when strictly greater (episode numbers).
    Sequence,
    /// UTC instant, advances only when strictly later.
    Timestamp,
    /// Opaque string, advances whenever it differs (latest post link).
    Marker,
}

impl WatermarkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkKind::Sequence => "sequence",
            WatermarkKind::Timestamp => "timestamp",
            WatermarkKind::Marker => "marker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequence" => Some(WatermarkKind::Sequence),
            "timestamp" => Some(WatermarkKind::Timestamp),
            "marker" => Some(WatermarkKind::Marker),
            _ => None,
        }
    }
}

impl fmt::Display for WatermarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last observed state of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Watermark {
    Sequence(i64),
    Timestamp(DateTime<Utc>),
    Marker(String),
}

impl Watermark {
    pub fn kind(&self) -> WatermarkKind {
        match self {
            Watermark::Sequence(_) => WatermarkKind::Sequence,
            Watermark::Timestamp(_) => WatermarkKind::Timestamp,
            Watermark::Marker(_) => WatermarkKind::Marker,
        }
    }

    /// Parse a raw upstream value into a watermark of the given kind.
    ///
    /// Timestamps accept RFC 3339 strings or integer unix seconds.
    pub fn parse(kind: WatermarkKind, raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match kind {
            WatermarkKind::Sequence => raw.parse::<i64>().ok().map(Watermark::Sequence),
            WatermarkKind::Timestamp => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
                    return Some(Watermark::Timestamp(dt.with_timezone(&Utc)));
                }
                raw.parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .map(Watermark::Timestamp)
            }
            WatermarkKind::Marker => Some(Watermark::Marker(raw.to_string())),
        }
    }

    /// Canonical string form, the inverse of `parse` for the same kind.
    pub fn encode(&self) -> String {
        match self {
            Watermark::Sequence(n) => n.to_string(),
            Watermark::Timestamp(dt) => dt.to_rfc3339(),
            Watermark::Marker(s) => s.clone(),
        }
    }

    /// Whether this observation supersedes `previous` under the subject's comparator.
    ///
    /// A previous watermark of a different kind means the subject was
    /// re-registered with a new comparator, so any value counts as an advance.
    pub fn is_newer_than(&self, previous: &Watermark) -> bool {
        match (self, previous) {
            (Watermark::Sequence(new), Watermark::Sequence(old)) => new > old,
            (Watermark::Timestamp(new), Watermark::Timestamp(old)) => new > old,
            (Watermark::Marker(new), Watermark::Marker(old)) => new != old,
            _ => true,
        }
    }

    /// Identity of the change this watermark represents, used as the idempotency key.
    pub fn change_id(&self) -> String {
        format!("{}:{}", self.kind().as_str(), self.encode())
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.change_id())
    }
}

// =============================================================================
// Subjects, recipients, changes
// =============================================================================

/// An upstream entity watched for changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedSubject {
    pub id: String,
    pub label: String,
    /// Upstream locator, an absolute URL or a path relative to the fetcher base URL.
    pub target: String,
    /// JSON pointer selecting the watermark value in the upstream response.
    pub selector: Option<String>,
    pub kind: WatermarkKind,
    /// Set when the upstream last reported the entity as gone.
    pub missing_since: Option<DateTime<Utc>>,
}

/// Someone to notify when a subject advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    /// Delivery address, a webhook URL for the HTTP sink.
    pub address: String,
    pub notifications_enabled: bool,
}

/// Current upstream state of a subject, as returned by a fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub watermark: Watermark,
    pub payload: serde_json::Value,
}

impl Observation {
    pub fn new(watermark: Watermark) -> Self {
        Self {
            watermark,
            payload: serde_json::Value::Null,
        }
    }
}

/// A detected advance of a subject's watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub subject_id: String,
    pub subject_label: String,
    pub change_id: String,
    pub previous: Option<Watermark>,
    pub current: Watermark,
    pub payload: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

// =============================================================================
// Delivery records
// =============================================================================

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    RecipientUnreachable,
    TransientError,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::RecipientUnreachable => "recipient_unreachable",
            DeliveryOutcome::TransientError => "transient_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delivered" => Some(DeliveryOutcome::Delivered),
            "recipient_unreachable" => Some(DeliveryOutcome::RecipientUnreachable),
            "transient_error" => Some(DeliveryOutcome::TransientError),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Idempotency marker for one (subject, change, recipient) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub subject_id: String,
    pub change_id: String,
    pub recipient_id: String,
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome.succeeded()
    }
}

// =============================================================================
// Cycle summary
// =============================================================================

/// Counters describing one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub subjects_checked: usize,
    pub changes_detected: usize,
    pub deliveries_attempted: usize,
    pub deliveries_failed: usize,
    /// Recipients skipped because a success or a permanent failure was already recorded.
    pub deliveries_skipped: usize,
    pub fetch_failures: usize,
    pub subjects_missing: usize,
    pub store_errors: usize,
    /// Subjects not started because the poller was stopping.
    pub subjects_skipped: usize,
}

impl CycleSummary {
    pub fn merge(&mut self, other: &CycleSummary) {
        self.subjects_checked += other.subjects_checked;
        self.changes_detected += other.changes_detected;
        self.deliveries_attempted += other.deliveries_attempted;
        self.deliveries_failed += other.deliveries_failed;
        self.deliveries_skipped += other.deliveries_skipped;
        self.fetch_failures += other.fetch_failures;
        self.subjects_missing += other.subjects_missing;
        self.store_errors += other.store_errors;
        self.subjects_skipped += other.subjects_skipped;
    }
}
