//! Event system for the comment moderation pipeline
//!
//! Provides shared event definitions and the EventBus.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

use crate::protocol::Classification;

/// What a user's override asks the pipeline to show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverrideIntent {
    #[default]
    None,
    /// User declared the comment normal; show it as such
    ForceNormal,
    /// Comment stays flagged but the user chose to read it
    ForceFlaggedButRevealed,
}

impl fmt::Display for OverrideIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideIntent::None => write!(f, "none"),
            OverrideIntent::ForceNormal => write!(f, "force_normal"),
            OverrideIntent::ForceFlaggedButRevealed => write!(f, "force_flagged_but_revealed"),
        }
    }
}

/// Moderation event types
///
/// Events are broadcast via EventBus and serialize as tagged JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ModerationEvent {
    /// A scan/reconcile sweep finished
    ScanCompleted {
        /// Occurrences visited
        occurrences: usize,
        /// Queue entries created by this sweep
        enqueued: usize,
        /// Render commands issued by this sweep
        render_commands: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An identity was placed on the request queue
    CommentQueued {
        identity: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The request queue handed an entry to the classifier
    RequestDispatched {
        identity: String,
        /// Entries still waiting behind this one
        pending: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A verdict was recorded and reconciled onto the page
    ClassificationApplied {
        identity: String,
        classification: Classification,
        /// Occurrences re-rendered in the same pass
        occurrences: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A request resolved as an error; the identity is retry-eligible
    ClassificationFailed {
        identity: String,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A response referenced an identity that was not in flight
    ResultDiscarded {
        identity: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    OverrideApplied {
        identity: String,
        intent: OverrideIntent,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    OverrideCleared {
        identity: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The request queue emptied with nothing in flight
    QueueDrained {
        /// Requests completed since the queue last started filling
        completed: usize,
        duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Outcome of a report-a-word action
    WordReported {
        word: String,
        success: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl ModerationEvent {
    /// Short event name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            ModerationEvent::ScanCompleted { .. } => "ScanCompleted",
            ModerationEvent::CommentQueued { .. } => "CommentQueued",
            ModerationEvent::RequestDispatched { .. } => "RequestDispatched",
            ModerationEvent::ClassificationApplied { .. } => "ClassificationApplied",
            ModerationEvent::ClassificationFailed { .. } => "ClassificationFailed",
            ModerationEvent::ResultDiscarded { .. } => "ResultDiscarded",
            ModerationEvent::OverrideApplied { .. } => "OverrideApplied",
            ModerationEvent::OverrideCleared { .. } => "OverrideCleared",
            ModerationEvent::QueueDrained { .. } => "QueueDrained",
            ModerationEvent::WordReported { .. } => "WordReported",
        }
    }
}

/// Channel capacity used by `EventBus::default`
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Broadcast channel for moderation events
///
/// Emitting never blocks the pipeline. A subscriber that falls more than
/// `capacity` events behind sees `RecvError::Lagged` and skips ahead.
///
/// ```
/// use cmod_common::events::{EventBus, ModerationEvent};
///
/// let bus = EventBus::new(16);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(ModerationEvent::CommentQueued {
///     identity: "pseudo--abc--hello".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(ModerationEvent::CommentQueued { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ModerationEvent>,
    capacity: usize,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Receiver for events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ModerationEvent> {
        self.tx.subscribe()
    }

    /// Send to every current subscriber; `Err` when there are none
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ModerationEvent,
    ) -> Result<usize, broadcast::error::SendError<ModerationEvent>> {
        self.tx.send(event)
    }

    /// Send, treating "nobody listening" as success
    pub fn emit_lossy(&self, event: ModerationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
