//! In-memory collaborators for the poller.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reconcile_poller::poller::{
    Change, DeliveryError, DeliveryOutcome, DeliveryRecord, DeliveryRecordStore, FetchError,
    NotificationSink, Observation, Recipient, RecipientStore, SubjectStore, TrackedSubject,
    UpstreamFetcher, Watermark,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type DeliveryKey = (String, String, String);

#[derive(Default)]
struct MemoryState {
    subjects: Vec<TrackedSubject>,
    watermarks: HashMap<String, Watermark>,
    recipients: HashMap<String, Recipient>,
    subscriptions: Vec<(String, String)>,
    deliveries: HashMap<DeliveryKey, DeliveryRecord>,
}

/// Store implementing every store capability on plain collections.
///
/// Subjects are kept in a Vec so tests can feed the poller a malformed list.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_set_watermark: AtomicBool,
    fail_list_subjects: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subject(&self, subject: TrackedSubject) {
        self.state.lock().unwrap().subjects.push(subject);
    }

    pub fn add_recipient(&self, recipient: Recipient) {
        self.state
            .lock()
            .unwrap()
            .recipients
            .insert(recipient.id.clone(), recipient);
    }

    pub fn subscribe(&self, subject_id: &str, recipient_id: &str) {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .push((subject_id.to_string(), recipient_id.to_string()));
    }

    pub fn seed_watermark(&self, subject_id: &str, watermark: Watermark) {
        self.state
            .lock()
            .unwrap()
            .watermarks
            .insert(subject_id.to_string(), watermark);
    }

    pub fn watermark(&self, subject_id: &str) -> Option<Watermark> {
        self.state.lock().unwrap().watermarks.get(subject_id).cloned()
    }

    pub fn subject(&self, subject_id: &str) -> Option<TrackedSubject> {
        self.state
            .lock()
            .unwrap()
            .subjects
            .iter()
            .find(|s| s.id == subject_id)
            .cloned()
    }

    pub fn delivery(&self, subject_id: &str, change_id: &str, recipient_id: &str) -> Option<DeliveryRecord> {
        self.state
            .lock()
            .unwrap()
            .deliveries
            .get(&key(subject_id, change_id, recipient_id))
            .cloned()
    }

    pub fn delivery_count(&self) -> usize {
        self.state.lock().unwrap().deliveries.len()
    }

    pub fn fail_set_watermark(&self, fail: bool) {
        self.fail_set_watermark.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list_subjects(&self, fail: bool) {
        self.fail_list_subjects.store(fail, Ordering::SeqCst);
    }
}

fn key(subject_id: &str, change_id: &str, recipient_id: &str) -> DeliveryKey {
    (
        subject_id.to_string(),
        change_id.to_string(),
        recipient_id.to_string(),
    )
}

impl SubjectStore for MemoryStore {
    fn list_subjects(&self) -> Result<Vec<TrackedSubject>> {
        if self.fail_list_subjects.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        Ok(self.state.lock().unwrap().subjects.clone())
    }

    fn get_watermark(&self, subject_id: &str) -> Result<Option<Watermark>> {
        Ok(self.watermark(subject_id))
    }

    fn set_watermark(&self, subject_id: &str, watermark: &Watermark) -> Result<bool> {
        if self.fail_set_watermark.load(Ordering::SeqCst) {
            bail!("disk I/O error");
        }
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.watermarks.get(subject_id) {
            if !watermark.is_newer_than(current) {
                return Ok(false);
            }
        }
        state
            .watermarks
            .insert(subject_id.to_string(), watermark.clone());
        Ok(true)
    }

    fn mark_missing(&self, subject_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.subjects.iter_mut().find(|s| s.id == subject_id) {
            Some(subject) if subject.missing_since.is_none() => {
                subject.missing_since = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear_missing(&self, subject_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(subject) = state.subjects.iter_mut().find(|s| s.id == subject_id) {
            subject.missing_since = None;
        }
        Ok(())
    }
}

impl RecipientStore for MemoryStore {
    fn recipients_for(&self, subject_id: &str) -> Result<Vec<Recipient>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter()
            .filter(|(s, _)| s == subject_id)
            .filter_map(|(_, r)| state.recipients.get(r).cloned())
            .collect())
    }
}

impl DeliveryRecordStore for MemoryStore {
    fn has_succeeded(&self, subject_id: &str, change_id: &str, recipient_id: &str) -> Result<bool> {
        Ok(self
            .delivery(subject_id, change_id, recipient_id)
            .map(|r| r.succeeded())
            .unwrap_or(false))
    }

    fn get_delivery(
        &self,
        subject_id: &str,
        change_id: &str,
        recipient_id: &str,
    ) -> Result<Option<DeliveryRecord>> {
        Ok(self.delivery(subject_id, change_id, recipient_id))
    }

    fn record(
        &self,
        subject_id: &str,
        change_id: &str,
        recipient_id: &str,
        outcome: DeliveryOutcome,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let record = state
            .deliveries
            .entry(key(subject_id, change_id, recipient_id))
            .or_insert_with(|| DeliveryRecord {
                subject_id: subject_id.to_string(),
                change_id: change_id.to_string(),
                recipient_id: recipient_id.to_string(),
                outcome,
                attempts: 0,
                last_error: None,
                first_attempt_at: now,
                last_attempt_at: now,
            });
        if record.succeeded() {
            return Ok(());
        }
        record.outcome = outcome;
        record.attempts += 1;
        record.last_error = error.map(String::from);
        record.last_attempt_at = now;
        Ok(())
    }

    fn prune_delivery_records(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let count = state.deliveries.len();
        state.deliveries.retain(|_, r| r.last_attempt_at >= before);
        Ok(count - state.deliveries.len())
    }
}

/// Upstream answering from a per-subject script.
///
/// Responses are consumed in order and the last one repeats forever.
/// Subjects without a script are reported as not found.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Result<Observation, FetchError>>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, subject_id: &str, responses: Vec<Result<Observation, FetchError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), responses.into());
    }

    /// Shorthand for a subject that always reports `watermark`.
    pub fn always(&self, subject_id: &str, watermark: Watermark) {
        self.script(subject_id, vec![Ok(Observation::new(watermark))]);
    }

    pub fn calls(&self, subject_id: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(subject_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl UpstreamFetcher for ScriptedFetcher {
    async fn fetch(&self, subject: &TrackedSubject) -> Result<Observation, FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(subject.id.clone())
            .or_default() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        let Some(script) = scripts.get_mut(&subject.id) else {
            return Err(FetchError::NotFound);
        };
        if script.len() > 1 {
            script.pop_front().unwrap_or(Err(FetchError::NotFound))
        } else {
            script.front().cloned().unwrap_or(Err(FetchError::NotFound))
        }
    }
}

/// Upstream that takes `latency` to answer and tracks how many fetches
/// overlap.
pub struct SlowFetcher {
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowFetcher {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Highest number of fetches seen running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamFetcher for SlowFetcher {
    async fn fetch(&self, _subject: &TrackedSubject) -> Result<Observation, FetchError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Observation::new(Watermark::Sequence(1)))
    }
}

/// Sink remembering every delivery it accepted.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(String, String)>>,
    attempts: Mutex<HashMap<String, u32>>,
    failures: Mutex<HashMap<String, DeliveryError>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery to `recipient_id` fails with `error` until cleared.
    pub fn fail_for(&self, recipient_id: &str, error: DeliveryError) {
        self.failures
            .lock()
            .unwrap()
            .insert(recipient_id.to_string(), error);
    }

    pub fn clear_failure(&self, recipient_id: &str) {
        self.failures.lock().unwrap().remove(recipient_id);
    }

    /// (recipient id, change id) pairs that were accepted.
    pub fn delivered(&self) -> Vec<(String, String)> {
        let mut delivered = self.delivered.lock().unwrap().clone();
        delivered.sort();
        delivered
    }

    pub fn attempts(&self, recipient_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(recipient_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, recipient: &Recipient, change: &Change) -> Result<(), DeliveryError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(recipient.id.clone())
            .or_default() += 1;

        if let Some(error) = self.failures.lock().unwrap().get(&recipient.id) {
            return Err(error.clone());
        }
        self.delivered
            .lock()
            .unwrap()
            .push((recipient.id.clone(), change.change_id.clone()));
        Ok(())
    }
}
