//! Reconciliation poller.
//!
//! On every tick the poller loads the tracked subjects, asks the upstream for
//! each subject's current watermark, and when it advanced notifies every
//! opted-in recipient once before persisting the new watermark.

mod capabilities;
mod context;
mod cycle;
mod error;
mod models;
#[allow(clippy::module_inception)]
mod poller;
mod retry_policy;

pub use capabilities::{
    DeliveryError, DeliveryRecordStore, FetchError, NotificationSink, RecipientStore,
    SubjectStore, UpstreamFetcher,
};
pub use context::PollerContext;
pub use error::PollerError;
pub use models::{
    Change, CycleSummary, DeliveryOutcome, DeliveryRecord, Observation, Recipient,
    TrackedSubject, Watermark, WatermarkKind,
};
pub use poller::Poller;
pub use retry_policy::RetryPolicy;
