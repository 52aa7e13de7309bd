//! Notification sinks

mod webhook_sink;

pub use webhook_sink::{WebhookPayload, WebhookSink};
