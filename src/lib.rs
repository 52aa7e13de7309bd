//! Reconciliation Poller Library
//!
//! A recurring task that watches unreliable upstreams for changes and
//! notifies subscribers at most once per change, plus the SQLite, HTTP and
//! webhook adapters the daemon wires into it.

pub mod config;
pub mod metrics;
pub mod notify;
pub mod poller;
pub mod poller_store;
pub mod sqlite_persistence;
pub mod upstream;

// Re-export commonly used types for convenience
pub use notify::WebhookSink;
pub use poller::{CycleSummary, Poller, PollerContext, PollerError};
pub use poller_store::{SqlitePollerStore, SubjectRegistry};
pub use upstream::HttpJsonFetcher;
