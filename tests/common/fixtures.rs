//! Builders for subjects, recipients and a fully wired poller.

use super::fakes::{MemoryStore, RecordingSink, ScriptedFetcher};
use reconcile_poller::config::PollerSettings;
use reconcile_poller::poller::{Poller, PollerContext, Recipient, TrackedSubject, WatermarkKind};
use std::sync::Arc;

pub const FRIEREN: &str = "frieren";
pub const DUNGEON_MESHI: &str = "dungeon-meshi";
pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";

pub fn subject(id: &str) -> TrackedSubject {
    TrackedSubject {
        id: id.to_string(),
        label: format!("Subject {}", id),
        target: format!("/anime/{}", id),
        selector: Some("/nextAiringEpisode/episode".to_string()),
        kind: WatermarkKind::Sequence,
        missing_since: None,
    }
}

pub fn subject_of_kind(id: &str, kind: WatermarkKind) -> TrackedSubject {
    TrackedSubject {
        kind,
        ..subject(id)
    }
}

pub fn recipient(id: &str) -> Recipient {
    Recipient {
        id: id.to_string(),
        address: format!("https://hooks.test/{}", id),
        notifications_enabled: true,
    }
}

/// Production defaults; paused-clock tests make the backoff free.
pub fn test_settings() -> PollerSettings {
    PollerSettings::default()
}

/// A poller over in-memory collaborators the test keeps handles to.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub sink: Arc<RecordingSink>,
    pub poller: Poller,
}

impl Harness {
    pub fn new(settings: PollerSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let sink = Arc::new(RecordingSink::new());
        let context = PollerContext::with_store(store.clone(), fetcher.clone(), sink.clone());
        Self {
            poller: Poller::new(context, settings),
            store,
            fetcher,
            sink,
        }
    }

    /// One subject with two subscribed recipients.
    pub fn with_two_subscribers(settings: PollerSettings) -> Self {
        let harness = Self::new(settings);
        harness.store.add_subject(subject(FRIEREN));
        harness.store.add_recipient(recipient(ALICE));
        harness.store.add_recipient(recipient(BOB));
        harness.store.subscribe(FRIEREN, ALICE);
        harness.store.subscribe(FRIEREN, BOB);
        harness
    }
}
