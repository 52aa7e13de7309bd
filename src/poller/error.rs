use thiserror::Error;

/// Contract violations surfaced by the poller's public operations.
///
/// Failures tied to a single subject never show up here; they are logged and
/// counted in the cycle summary instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollerError {
    #[error("Poller is already running")]
    AlreadyRunning,

    #[error("Poll interval must be greater than zero")]
    InvalidInterval,

    #[error("Invalid subject list: {0}")]
    InvalidSubjectList(String),
}
