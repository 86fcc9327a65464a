//! Structured progress events.
//!
//! The core emits events without ever waiting on the consumer: the channel is
//! bounded and an event that does not fit is dropped (and traced).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Which part of the lifecycle an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discover,
    Mount,
    Refresh,
    Unmount,
    Queue,
    Publish,
    Retry,
    Complete,
    Fail,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub site_key: String,
    pub phase: Phase,
    pub message: String,
    pub level: EventLevel,
    pub timestamp: DateTime<Utc>,
}

/// Fire-and-forget sender of progress events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl EventSink {
    /// Create a sink and the receiving end of its buffer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only traces.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit an event. Never blocks.
    pub fn emit(&self, site_key: &str, phase: Phase, level: EventLevel, message: impl Into<String>) {
        let message = message.into();

        match level {
            EventLevel::Debug => debug!(site = site_key, ?phase, "{}", message),
            EventLevel::Info => info!(site = site_key, ?phase, "{}", message),
            EventLevel::Warn => warn!(site = site_key, ?phase, "{}", message),
            EventLevel::Error => error!(site = site_key, ?phase, "{}", message),
        }

        let Some(tx) = &self.tx else {
            return;
        };

        let event = ProgressEvent {
            site_key: site_key.to_string(),
            phase,
            message,
            level,
            timestamp: Utc::now(),
        };

        if let Err(e) = tx.try_send(event) {
            debug!("Dropped progress event for site {}: {}", site_key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_event() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit("docs", Phase::Mount, EventLevel::Info, "mounted source");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.site_key, "docs");
        assert_eq!(event.phase, Phase::Mount);
        assert_eq!(event.level, EventLevel::Info);
        assert_eq!(event.message, "mounted source");
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit("docs", Phase::Publish, EventLevel::Info, "first");
        sink.emit("docs", Phase::Publish, EventLevel::Info, "second");

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_sink() {
        let sink = EventSink::disabled();
        sink.emit("docs", Phase::Fail, EventLevel::Error, "nobody listens");
    }

    #[tokio::test]
    async fn test_closed_receiver_is_ignored() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        sink.emit("docs", Phase::Complete, EventLevel::Info, "done");
    }
}
