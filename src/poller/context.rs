use super::capabilities::{
    DeliveryRecordStore, NotificationSink, RecipientStore, SubjectStore, UpstreamFetcher,
};
use std::sync::Arc;

/// Collaborators a poller works against.
///
/// Every piece of state lives behind these handles and is read fresh each
/// cycle; the poller keeps nothing in memory between cycles.
#[derive(Clone)]
pub struct PollerContext {
    pub subject_store: Arc<dyn SubjectStore>,
    pub recipient_store: Arc<dyn RecipientStore>,
    pub delivery_store: Arc<dyn DeliveryRecordStore>,
    pub fetcher: Arc<dyn UpstreamFetcher>,
    pub sink: Arc<dyn NotificationSink>,
}

impl PollerContext {
    pub fn new(
        subject_store: Arc<dyn SubjectStore>,
        recipient_store: Arc<dyn RecipientStore>,
        delivery_store: Arc<dyn DeliveryRecordStore>,
        fetcher: Arc<dyn UpstreamFetcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            subject_store,
            recipient_store,
            delivery_store,
            fetcher,
            sink,
        }
    }

    /// Context backed by a single store implementing every store capability.
    pub fn with_store<S>(
        store: Arc<S>,
        fetcher: Arc<dyn UpstreamFetcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self
    where
        S: SubjectStore + RecipientStore + DeliveryRecordStore + 'static,
    {
        Self {
            subject_store: store.clone(),
            recipient_store: store.clone(),
            delivery_store: store,
            fetcher,
            sink,
        }
    }
}
