//! Comment registry
//!
//! Single source of truth for "have we seen this text, and what did we decide".
//! One record per identity, alive for the lifetime of the page view. Records
//! are only mutated through the guarded transition methods below.
//!
//! ```text
//!            mark_queued        mark_in_flight        mark_classified
//!   New ────────────────▶ Queued ──────────▶ InFlight ───────────────▶ Classified
//!                           ▲                   │
//!                           │ mark_queued       │ mark_error
//!                           └────── Error ◀─────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::CommentId;

pub use cmod_common::events::OverrideIntent;
pub use cmod_common::protocol::Classification;

/// Classification lifecycle of one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    New,
    Queued,
    InFlight,
    Classified,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::New => write!(f, "new"),
            Status::Queued => write!(f, "queued"),
            Status::InFlight => write!(f, "in_flight"),
            Status::Classified => write!(f, "classified"),
            Status::Error => write!(f, "error"),
        }
    }
}

/// Registry transition failures
///
/// None of these are fatal; callers log and carry on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown identity {0}")]
    UnknownIdentity(CommentId),

    #[error("illegal transition for {identity}: {from} -> {to}")]
    IllegalTransition {
        identity: CommentId,
        from: Status,
        to: Status,
    },

    /// A result arrived for an identity that is not in flight
    #[error("late or unknown result for {identity} (status {status:?})")]
    LateOrUnknownResult {
        identity: CommentId,
        status: Option<Status>,
    },

    #[error("override not allowed for {identity} while {status}")]
    OverrideNotAllowed { identity: CommentId, status: Status },

    #[error("{0} has no override to clear")]
    NotOverridden(CommentId),
}

/// Per-identity classification state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentRecord {
    original_text: String,
    status: Status,
    classification: Classification,
    user_overridden: bool,
    override_intent: OverrideIntent,
    attempts: u32,
}

impl CommentRecord {
    fn new(original_text: String) -> Self {
        Self {
            original_text,
            status: Status::New,
            classification: Classification::Unknown,
            user_overridden: false,
            override_intent: OverrideIntent::None,
            attempts: 0,
        }
    }

    /// Text captured at first sight; never changes afterwards
    pub fn original_text(&self) -> &str {
        &self.original_text
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn user_overridden(&self) -> bool {
        self.user_overridden
    }

    /// Meaningful only while `user_overridden()` is true
    pub fn override_intent(&self) -> OverrideIntent {
        if self.user_overridden {
            self.override_intent
        } else {
            OverrideIntent::None
        }
    }

    /// Number of times this identity has been sent to the classifier
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Per-status record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub new: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub classified: usize,
    pub error: usize,
}

/// In-memory identity → record store
#[derive(Debug, Default)]
pub struct CommentRegistry {
    records: HashMap<CommentId, CommentRecord>,
}

impl CommentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, identity: &CommentId) -> Option<&CommentRecord> {
        self.records.get(identity)
    }

    /// Return the record for `identity`, creating it with status `New` if absent
    ///
    /// An existing record keeps its original text.
    pub fn create_if_absent(&mut self, identity: &CommentId, text: &str) -> &CommentRecord {
        self.records.entry(identity.clone()).or_insert_with(|| {
            debug!(identity = %identity.short(), "New comment record");
            CommentRecord::new(text.to_string())
        })
    }

    /// New → Queued on first sight, Error → Queued on retry
    pub fn mark_queued(&mut self, identity: &CommentId) -> Result<(), RegistryError> {
        let record = self.record_mut(identity)?;
        match record.status {
            Status::New | Status::Error => {
                record.status = Status::Queued;
                Ok(())
            }
            from => Err(illegal(identity, from, Status::Queued)),
        }
    }

    /// Queued → InFlight
    pub fn mark_in_flight(&mut self, identity: &CommentId) -> Result<(), RegistryError> {
        let record = self.record_mut(identity)?;
        match record.status {
            Status::Queued => {
                record.status = Status::InFlight;
                record.attempts += 1;
                Ok(())
            }
            from => Err(illegal(identity, from, Status::InFlight)),
        }
    }

    /// InFlight → Classified
    ///
    /// Any other starting state means the result is late or duplicated: the
    /// record is left untouched and the anomaly is logged.
    pub fn mark_classified(
        &mut self,
        identity: &CommentId,
        classification: Classification,
    ) -> Result<&CommentRecord, RegistryError> {
        let record = self.in_flight_record(identity)?;
        record.status = Status::Classified;
        // A user's "restore to normal" is a correction the service does not get to undo
        if !(record.user_overridden && record.override_intent == OverrideIntent::ForceNormal) {
            record.classification = classification;
        }
        Ok(record)
    }

    /// InFlight → Error (retry-eligible on the next scan)
    pub fn mark_error(&mut self, identity: &CommentId) -> Result<&CommentRecord, RegistryError> {
        let record = self.in_flight_record(identity)?;
        record.status = Status::Error;
        Ok(record)
    }

    /// Record a user's override; legal once the identity has been dispatched
    pub fn apply_override(
        &mut self,
        identity: &CommentId,
        intent: OverrideIntent,
    ) -> Result<&CommentRecord, RegistryError> {
        let record = self.record_mut(identity)?;
        if matches!(record.status, Status::New | Status::Queued) || intent == OverrideIntent::None {
            return Err(RegistryError::OverrideNotAllowed {
                identity: identity.clone(),
                status: record.status,
            });
        }

        record.user_overridden = true;
        record.override_intent = intent;
        if intent == OverrideIntent::ForceNormal {
            record.classification = Classification::Normal;
        }
        Ok(record)
    }

    /// Hand the identity back to system-controlled rendering
    pub fn clear_override(&mut self, identity: &CommentId) -> Result<&CommentRecord, RegistryError> {
        let record = self.record_mut(identity)?;
        if !record.user_overridden {
            return Err(RegistryError::NotOverridden(identity.clone()));
        }
        record.user_overridden = false;
        record.override_intent = OverrideIntent::None;
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CommentId, &CommentRecord)> {
        self.records.iter()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            match record.status {
                Status::New => counts.new += 1,
                Status::Queued => counts.queued += 1,
                Status::InFlight => counts.in_flight += 1,
                Status::Classified => counts.classified += 1,
                Status::Error => counts.error += 1,
            }
        }
        counts
    }

    fn record_mut(&mut self, identity: &CommentId) -> Result<&mut CommentRecord, RegistryError> {
        self.records
            .get_mut(identity)
            .ok_or_else(|| RegistryError::UnknownIdentity(identity.clone()))
    }

    fn in_flight_record(&mut self, identity: &CommentId) -> Result<&mut CommentRecord, RegistryError> {
        match self.records.get_mut(identity) {
            Some(record) if record.status == Status::InFlight => Ok(record),
            other => {
                let status = other.map(|r| r.status);
                warn!(
                    identity = %identity.short(),
                    status = ?status,
                    "Discarding result for identity that is not in flight"
                );
                Err(RegistryError::LateOrUnknownResult {
                    identity: identity.clone(),
                    status,
                })
            }
        }
    }
}

fn illegal(identity: &CommentId, from: Status, to: Status) -> RegistryError {
    warn!(identity = %identity.short(), %from, %to, "Illegal registry transition");
    RegistryError::IllegalTransition {
        identity: identity.clone(),
        from,
        to,
    }
}
