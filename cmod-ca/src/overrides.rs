//! User overrides of the classifier's verdict
//!
//! Each action resolves the occurrence's identity through the rendering
//! ledger, records the override in the registry, then reconciles every
//! occurrence of that identity so they all agree.

use tracing::info;

use cmod_common::events::ModerationEvent;
use cmod_common::protocol::ReportWordRequest;

use crate::dom::{DomSource, OccurrenceId};
use crate::error::{Error, Result};
use crate::identity::CommentId;
use crate::reconcile::{Reconciler, RenderState};
use crate::registry::OverrideIntent;

impl Reconciler {
    /// Show a flagged comment's original text with a "hide again" control
    pub fn reveal<D: DomSource>(&mut self, dom: &mut D, occurrence: OccurrenceId) -> Result<CommentId> {
        let identity = self.rendered_as(occurrence, &[RenderState::Flagged])?;
        self.override_identity(dom, &identity, OverrideIntent::ForceFlaggedButRevealed)?;
        Ok(identity)
    }

    /// Undo a reveal; the identity goes back to system-controlled rendering
    pub fn hide_again<D: DomSource>(&mut self, dom: &mut D, occurrence: OccurrenceId) -> Result<CommentId> {
        let identity = self.rendered_as(occurrence, &[RenderState::Revealed])?;
        self.registry.clear_override(&identity)?;
        let occurrences = self.reconcile_identity(dom, &identity);

        info!(identity = %identity.short(), occurrences, "Override cleared");
        self.events.emit_lossy(ModerationEvent::OverrideCleared {
            identity: identity.to_string(),
            timestamp: chrono::Utc::now(),
        });
        Ok(identity)
    }

    /// Mark a flagged (or revealed) comment as normal from the user's point of view
    pub fn restore_normal<D: DomSource>(&mut self, dom: &mut D, occurrence: OccurrenceId) -> Result<CommentId> {
        let identity = self.rendered_as(occurrence, &[RenderState::Flagged, RenderState::Revealed])?;
        self.override_identity(dom, &identity, OverrideIntent::ForceNormal)?;
        Ok(identity)
    }

    /// Build a report-a-word request using the occurrence's original text as context
    pub fn word_report(&self, occurrence: OccurrenceId, word: &str, reason: &str) -> Result<ReportWordRequest> {
        let rendering = self
            .ledger
            .get(occurrence)
            .ok_or(Error::UnknownOccurrence(occurrence))?;

        let report = ReportWordRequest {
            word: word.trim().to_string(),
            reason: reason.trim().to_string(),
            context: rendering.text.clone(),
        };
        report.validate().map_err(|e| Error::BadRequest(e.to_string()))?;
        Ok(report)
    }

    fn override_identity<D: DomSource>(
        &mut self,
        dom: &mut D,
        identity: &CommentId,
        intent: OverrideIntent,
    ) -> Result<()> {
        self.registry.apply_override(identity, intent)?;
        let occurrences = self.reconcile_identity(dom, identity);

        info!(identity = %identity.short(), %intent, occurrences, "Override applied");
        self.events.emit_lossy(ModerationEvent::OverrideApplied {
            identity: identity.to_string(),
            intent,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Identity of `occurrence`, provided it currently shows one of `allowed`
    fn rendered_as(&self, occurrence: OccurrenceId, allowed: &[RenderState]) -> Result<CommentId> {
        let rendering = self
            .ledger
            .get(occurrence)
            .ok_or(Error::UnknownOccurrence(occurrence))?;

        match rendering.state {
            Some(state) if allowed.contains(&state) => Ok(rendering.identity.clone()),
            state => Err(Error::BadRequest(format!(
                "occurrence {} is rendered as {:?}",
                occurrence, state
            ))),
        }
    }
}
