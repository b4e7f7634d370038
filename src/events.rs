//! Event and progress bus
//!
//! A broadcast channel of typed phase/status events. Producers push; the
//! CLI renderer and the dashboard's SSE feed subscribe. A consumer that
//! falls behind the bounded backlog loses oldest progress events (the
//! channel lags past them), but terminal events are emitted last and
//! survive because a lagged receiver resumes at the newest retained
//! message.

use crate::compare::DiffMetrics;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Number of events retained for slow consumers.
pub const EVENT_BACKLOG: usize = 256;

/// Status attached to a comparison event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStatus {
    New,
    Match,
    Diff,
    BaselineUpdated,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VizzlyEvent {
    Scanning {
        total: usize,
    },
    Processing {
        current: usize,
        total: usize,
    },
    Deduplication {
        #[serde(rename = "toUpload")]
        to_upload: usize,
        existing: usize,
        total: usize,
    },
    Uploading {
        current: usize,
        total: usize,
    },
    Completed {
        #[serde(rename = "buildId")]
        build_id: String,
        url: String,
    },
    Comparison {
        id: String,
        name: String,
        status: ComparisonStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        metrics: Option<DiffMetrics>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
}

impl VizzlyEvent {
    /// Terminal events end a phase sequence and must reach every consumer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VizzlyEvent::Completed { .. } | VizzlyEvent::Error { .. })
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VizzlyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BACKLOG);
        Self { sender }
    }

    /// Pushes an event to all current subscribers. An event with no
    /// subscribers is dropped silently; producers never block.
    pub fn emit(&self, event: VizzlyEvent) {
        debug!(?event, "event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VizzlyEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
