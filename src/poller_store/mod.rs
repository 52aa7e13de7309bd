mod schema;
mod sqlite_poller_store;

pub use schema::POLLER_VERSIONED_SCHEMAS;
pub use sqlite_poller_store::SqlitePollerStore;

use crate::poller::{DeliveryRecord, Recipient, TrackedSubject};
use anyhow::Result;

/// Write side used by the registration collaborator.
///
/// The poller itself only reads subjects and recipients.
pub trait SubjectRegistry: Send + Sync {
    fn add_subject(&self, subject: &TrackedSubject) -> Result<()>;
    /// Removes the subject with its watermark, subscriptions and delivery records.
    fn remove_subject(&self, subject_id: &str) -> Result<bool>;
    fn get_subject(&self, subject_id: &str) -> Result<Option<TrackedSubject>>;

    fn add_recipient(&self, recipient: &Recipient) -> Result<()>;
    fn remove_recipient(&self, recipient_id: &str) -> Result<bool>;
    fn set_notifications_enabled(&self, recipient_id: &str, enabled: bool) -> Result<bool>;
    fn list_recipients(&self) -> Result<Vec<Recipient>>;

    /// Returns false when the subscription already existed.
    fn subscribe(&self, subject_id: &str, recipient_id: &str) -> Result<bool>;
    fn unsubscribe(&self, subject_id: &str, recipient_id: &str) -> Result<bool>;

    fn list_missing_subjects(&self) -> Result<Vec<TrackedSubject>>;
    /// Most recent attempts first.
    fn list_deliveries(&self, subject_id: &str) -> Result<Vec<DeliveryRecord>>;
}
