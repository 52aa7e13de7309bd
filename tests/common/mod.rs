//! Common test infrastructure
//!
//! In-memory stores, a scripted upstream and a recording sink for driving the
//! poller deterministically, plus a throwaway HTTP server standing in for a
//! real upstream API and webhook receivers.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{subject, test_settings, Harness};
//! use reconcile_poller::poller::Watermark;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_something() {
//!     let harness = Harness::new(test_settings());
//!     harness.store.add_subject(subject("frieren"));
//!     harness.fetcher.always("frieren", Watermark::Sequence(6));
//!     harness.poller.run_once().await.unwrap();
//! }
//! ```
#![allow(dead_code)]

mod fakes;
mod fixtures;
mod stub_server;

pub use fakes::{MemoryStore, RecordingSink, ScriptedFetcher, SlowFetcher};
pub use fixtures::*;
pub use stub_server::{StubServer, WebhookInbox};
