//! One reconciliation cycle: fetch, diff, notify, persist.

use super::capabilities::{DeliveryError, FetchError};
use super::context::PollerContext;
use super::error::PollerError;
use super::models::{Change, CycleSummary, DeliveryOutcome, Observation, TrackedSubject};
use super::retry_policy::RetryPolicy;
use crate::config::PollerSettings;
use crate::metrics;
use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use std::collections::HashSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs cycles against a fixed set of collaborators and settings.
pub(crate) struct Reconciler {
    context: PollerContext,
    settings: PollerSettings,
    retry_policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(context: PollerContext, settings: PollerSettings) -> Self {
        let retry_policy = RetryPolicy::new(&settings);
        Self {
            context,
            settings,
            retry_policy,
        }
    }

    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, PollerError> {
        let started = Instant::now();
        let mut summary = CycleSummary::default();

        let subjects = match self.context.subject_store.list_subjects() {
            Ok(subjects) => subjects,
            Err(e) => {
                error!("Failed to load tracked subjects: {:#}", e);
                metrics::record_store_error("list_subjects");
                summary.store_errors += 1;
                metrics::record_cycle(&summary, started.elapsed());
                return Ok(summary);
            }
        };
        validate_subjects(&subjects)?;
        metrics::set_tracked_subjects(subjects.len());

        if subjects.is_empty() {
            debug!("No tracked subjects, nothing to reconcile");
            metrics::record_cycle(&summary, started.elapsed());
            return Ok(summary);
        }

        let concurrency = self.settings.max_concurrency.max(1);
        let pending: Vec<_> = subjects
            .iter()
            .map(|subject| self.guarded(subject, cancel))
            .collect();
        let results: Vec<CycleSummary> = stream::iter(pending)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for result in &results {
            summary.merge(result);
        }

        let elapsed = started.elapsed();
        metrics::record_cycle(&summary, elapsed);
        info!(
            "Cycle finished in {:?}: {} checked, {} changes, {} deliveries ({} failed), {} fetch failures, {} store errors",
            elapsed,
            summary.subjects_checked,
            summary.changes_detected,
            summary.deliveries_attempted,
            summary.deliveries_failed,
            summary.fetch_failures,
            summary.store_errors
        );
        if summary.subjects_skipped > 0 {
            info!(
                "{} subjects skipped because the poller is stopping",
                summary.subjects_skipped
            );
        }
        Ok(summary)
    }

    /// Cancellation is only observed here, before a subject starts. Once
    /// started, a subject runs to completion.
    async fn guarded(&self, subject: &TrackedSubject, cancel: &CancellationToken) -> CycleSummary {
        if cancel.is_cancelled() {
            return CycleSummary {
                subjects_skipped: 1,
                ..Default::default()
            };
        }
        self.process_subject(subject).await
    }

    async fn process_subject(&self, subject: &TrackedSubject) -> CycleSummary {
        let mut summary = CycleSummary {
            subjects_checked: 1,
            ..Default::default()
        };
        if let Err(e) = self.reconcile_subject(subject, &mut summary).await {
            error!("Store failure while reconciling subject {}: {:#}", subject.id, e);
            metrics::record_store_error("reconcile_subject");
            summary.store_errors += 1;
        }
        summary
    }

    /// Store errors bubble up and abort the subject before the watermark moves.
    async fn reconcile_subject(
        &self,
        subject: &TrackedSubject,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let store = &self.context.subject_store;

        let observation = match self.fetch_with_retry(subject).await {
            Ok(observation) => observation,
            Err(FetchError::NotFound) => {
                summary.subjects_missing += 1;
                if store.mark_missing(&subject.id).context("mark_missing")? {
                    warn!(
                        "Subject {} ({}) is no longer found upstream",
                        subject.id, subject.label
                    );
                } else {
                    debug!("Subject {} still missing upstream", subject.id);
                }
                return Ok(());
            }
            Err(e) => {
                summary.fetch_failures += 1;
                warn!("Giving up on subject {} for this cycle: {}", subject.id, e);
                return Ok(());
            }
        };

        if subject.missing_since.is_some() {
            store.clear_missing(&subject.id).context("clear_missing")?;
            info!("Subject {} is available upstream again", subject.id);
        }

        if observation.watermark.kind() != subject.kind {
            summary.fetch_failures += 1;
            warn!(
                "Subject {} expects {} watermarks but upstream returned {}",
                subject.id,
                subject.kind,
                observation.watermark.kind()
            );
            return Ok(());
        }

        let previous = store.get_watermark(&subject.id).context("get_watermark")?;
        match &previous {
            Some(previous) if !observation.watermark.is_newer_than(previous) => {
                debug!("Subject {} unchanged at {}", subject.id, previous);
                return Ok(());
            }
            None if !self.settings.announce_first_observation => {
                store
                    .set_watermark(&subject.id, &observation.watermark)
                    .context("set_watermark")?;
                info!(
                    "Recorded baseline {} for subject {}",
                    observation.watermark, subject.id
                );
                return Ok(());
            }
            _ => {}
        }

        summary.changes_detected += 1;
        let change = build_change(subject, previous, observation);
        info!(
            "Subject {} advanced to {}",
            subject.id, change.change_id
        );

        self.notify_recipients(subject, &change, summary).await?;

        // Advance regardless of delivery outcomes
        if !store
            .set_watermark(&subject.id, &change.current)
            .context("set_watermark")?
        {
            warn!(
                "Store refused to move subject {} to {}",
                subject.id, change.change_id
            );
        }
        Ok(())
    }

    async fn notify_recipients(
        &self,
        subject: &TrackedSubject,
        change: &Change,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let recipients = self
            .context
            .recipient_store
            .recipients_for(&subject.id)
            .context("recipients_for")?;
        let deliveries = &self.context.delivery_store;

        for recipient in recipients.iter().filter(|r| r.notifications_enabled) {
            let existing = deliveries
                .get_delivery(&subject.id, &change.change_id, &recipient.id)
                .context("get_delivery")?;
            if let Some(record) = existing {
                if record.succeeded() {
                    summary.deliveries_skipped += 1;
                    debug!(
                        "{} already notified of {} for {}",
                        recipient.id, change.change_id, subject.id
                    );
                    continue;
                }
                if record.attempts >= self.settings.max_delivery_attempts {
                    summary.deliveries_skipped += 1;
                    debug!(
                        "Giving up on notifying {} of {} after {} attempts",
                        recipient.id, change.change_id, record.attempts
                    );
                    continue;
                }
            }

            summary.deliveries_attempted += 1;
            let result = match tokio::time::timeout(
                self.settings.delivery_timeout(),
                self.context.sink.deliver(recipient, change),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Transient(format!(
                    "timed out after {:?}",
                    self.settings.delivery_timeout()
                ))),
            };

            let (outcome, error) = match &result {
                Ok(()) => {
                    debug!("Notified {} of {}", recipient.id, change.change_id);
                    (DeliveryOutcome::Delivered, None)
                }
                Err(e) => {
                    summary.deliveries_failed += 1;
                    warn!(
                        "Failed to notify {} of {} for {}: {}",
                        recipient.id, change.change_id, subject.id, e
                    );
                    (e.outcome(), Some(e.to_string()))
                }
            };
            metrics::record_delivery(outcome);
            deliveries
                .record(
                    &subject.id,
                    &change.change_id,
                    &recipient.id,
                    outcome,
                    error.as_deref(),
                )
                .context("record delivery")?;
        }
        Ok(())
    }

    /// Fetch with per-attempt timeout, backoff on transient failures and
    /// upstream-directed waits on rate limiting.
    async fn fetch_with_retry(&self, subject: &TrackedSubject) -> Result<Observation, FetchError> {
        let timeout = self.settings.fetch_timeout();
        let mut failures: u32 = 0;
        let mut rate_limit_waits: u32 = 0;

        loop {
            let result =
                match tokio::time::timeout(timeout, self.context.fetcher.fetch(subject)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Transient(format!("timed out after {:?}", timeout))),
                };
            metrics::record_fetch_attempt(match &result {
                Ok(_) => "ok",
                Err(e) => e.as_str(),
            });

            let error = match result {
                Ok(observation) => return Ok(observation),
                Err(e) => e,
            };

            let delay = match &error {
                FetchError::RateLimited(retry_after) => {
                    if rate_limit_waits >= self.retry_policy.max_rate_limit_waits {
                        return Err(error);
                    }
                    if *retry_after > self.retry_policy.max_rate_limit_wait {
                        info!(
                            "Upstream asked to wait {:?} for subject {}, deferring to a later cycle",
                            retry_after, subject.id
                        );
                        return Err(error);
                    }
                    rate_limit_waits += 1;
                    info!(
                        "Upstream rate limited subject {}, waiting {:?}",
                        subject.id, retry_after
                    );
                    *retry_after
                }
                _ => {
                    failures += 1;
                    if !self.retry_policy.should_retry(&error, failures) {
                        return Err(error);
                    }
                    let delay = self.retry_policy.backoff_with_jitter(failures - 1);
                    debug!(
                        "Fetch attempt {} for subject {} failed ({}), retrying in {:?}",
                        failures, subject.id, error, delay
                    );
                    delay
                }
            };

            tokio::time::sleep(delay).await;
        }
    }
}

fn validate_subjects(subjects: &[TrackedSubject]) -> Result<(), PollerError> {
    let mut seen = HashSet::with_capacity(subjects.len());
    for subject in subjects {
        if subject.id.trim().is_empty() {
            return Err(PollerError::InvalidSubjectList(
                "subject with empty id".to_string(),
            ));
        }
        if !seen.insert(subject.id.as_str()) {
            return Err(PollerError::InvalidSubjectList(format!(
                "duplicate subject id {}",
                subject.id
            )));
        }
    }
    Ok(())
}

fn build_change(
    subject: &TrackedSubject,
    previous: Option<super::models::Watermark>,
    observation: Observation,
) -> Change {
    Change {
        subject_id: subject.id.clone(),
        subject_label: subject.label.clone(),
        change_id: observation.watermark.change_id(),
        previous,
        current: observation.watermark,
        payload: observation.payload,
        detected_at: chrono::Utc::now(),
    }
}
