//! Scan/reconcile loop
//!
//! Walks every rendered occurrence, derives its identity, consults the
//! registry and issues whatever render commands the record's state implies.
//! The [`RenderLedger`] remembers what was last drawn on each occurrence so
//! a sweep over unchanged state issues nothing; rendered text is never read
//! back to recover state.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info, trace, warn};

use cmod_common::events::{EventBus, ModerationEvent};

use crate::classifier::{ClassificationOutcome, ClassifierError};
use crate::dom::{DomSource, OccurrenceId, RenderCommand};
use crate::error::{Error, Result};
use crate::identity::{CommentId, IdentityDeriver};
use crate::queue::{QueueEntry, RequestQueue};
use crate::registry::{Classification, CommentRecord, CommentRegistry, OverrideIntent, Status};

/// What the pipeline last drew on an occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderState {
    /// Checking placeholder while the verdict is pending
    Checking,
    /// Original text, classified normal
    Normal,
    /// Censored placeholder plus reveal control
    Flagged,
    /// Flagged but shown by the user, with a hide control
    Revealed,
    /// User restored the comment to normal
    ForcedNormal,
    /// Classification failed; original text shown until the next scan
    ErrorRestored,
}

impl RenderState {
    /// Commands that draw this state onto an occurrence showing `text`
    pub fn commands(self, text: &str) -> Vec<RenderCommand> {
        match self {
            RenderState::Checking => vec![RenderCommand::RenderChecking {
                text: text.to_string(),
            }],
            RenderState::Flagged => vec![RenderCommand::RenderFlagged, RenderCommand::AttachRevealControl],
            RenderState::Revealed => vec![
                RenderCommand::RenderNormal {
                    text: text.to_string(),
                },
                RenderCommand::AttachHideControl,
            ],
            RenderState::Normal | RenderState::ForcedNormal | RenderState::ErrorRestored => {
                vec![RenderCommand::RenderNormal {
                    text: text.to_string(),
                }]
            }
        }
    }

    /// State a record calls for, ignoring retry eligibility
    pub fn for_record(record: &CommentRecord) -> Self {
        match record.override_intent() {
            OverrideIntent::ForceNormal => return RenderState::ForcedNormal,
            // Holds even if a colliding text later reclassified the identity as normal
            OverrideIntent::ForceFlaggedButRevealed => return RenderState::Revealed,
            OverrideIntent::None => {}
        }
        match record.status() {
            Status::Classified if record.classification().is_flagged() => RenderState::Flagged,
            Status::Classified => RenderState::Normal,
            Status::Error => RenderState::ErrorRestored,
            Status::New | Status::Queued | Status::InFlight => RenderState::Checking,
        }
    }
}

/// Ledger entry for one occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendering {
    pub identity: CommentId,
    /// Original text of this occurrence
    pub text: String,
    /// None until the first render
    pub state: Option<RenderState>,
    pub report_attached: bool,
}

/// Occurrence → last rendering
#[derive(Debug, Default)]
pub struct RenderLedger {
    entries: HashMap<OccurrenceId, Rendering>,
}

impl RenderLedger {
    pub fn get(&self, occurrence: OccurrenceId) -> Option<&Rendering> {
        self.entries.get(&occurrence)
    }

    pub fn identity_of(&self, occurrence: OccurrenceId) -> Option<&CommentId> {
        self.entries.get(&occurrence).map(|r| &r.identity)
    }

    /// Every tracked occurrence of `identity`, in ascending order
    pub fn occurrences_of(&self, identity: &CommentId) -> Vec<OccurrenceId> {
        let mut found: Vec<OccurrenceId> = self
            .entries
            .iter()
            .filter(|(_, r)| &r.identity == identity)
            .map(|(occurrence, _)| *occurrence)
            .collect();
        found.sort();
        found
    }

    pub fn forget(&mut self, occurrence: OccurrenceId) -> Option<Rendering> {
        self.entries.remove(&occurrence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start (or restart) tracking an occurrence
    ///
    /// A recycled occurrence now showing a different identity starts over.
    fn track(&mut self, occurrence: OccurrenceId, identity: &CommentId, text: &str) {
        match self.entries.get(&occurrence) {
            Some(existing) if &existing.identity == identity => {}
            _ => {
                self.entries.insert(
                    occurrence,
                    Rendering {
                        identity: identity.clone(),
                        text: text.to_string(),
                        state: None,
                        report_attached: false,
                    },
                );
            }
        }
    }

    fn retain_present(&mut self, present: &HashSet<OccurrenceId>) {
        self.entries.retain(|occurrence, _| present.contains(occurrence));
    }
}

/// Summary of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub occurrences: usize,
    pub enqueued: usize,
    pub render_commands: usize,
}

/// Registry, queue and ledger, plus the rules that connect them
pub struct Reconciler {
    pub(crate) deriver: IdentityDeriver,
    pub(crate) stream_id: String,
    pub(crate) registry: CommentRegistry,
    pub(crate) queue: RequestQueue,
    pub(crate) ledger: RenderLedger,
    pub(crate) events: EventBus,
}

impl Reconciler {
    pub fn new(deriver: IdentityDeriver, stream_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            deriver,
            stream_id: stream_id.into(),
            registry: CommentRegistry::new(),
            queue: RequestQueue::new(),
            ledger: RenderLedger::default(),
            events,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn registry(&self) -> &CommentRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &RenderLedger {
        &self.ledger
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Sweep every occurrence currently in the document
    pub fn scan<D: DomSource>(&mut self, dom: &mut D) -> ScanReport {
        let occurrences = dom.occurrences();
        let present: HashSet<OccurrenceId> = occurrences.iter().copied().collect();
        self.ledger.retain_present(&present);

        let mut report = ScanReport {
            occurrences: occurrences.len(),
            ..ScanReport::default()
        };

        for occurrence in occurrences {
            let Some(text) = dom.original_text(occurrence) else {
                trace!(%occurrence, "Occurrence has no text yet");
                continue;
            };
            let identity = match self.deriver.derive(&text, &self.stream_id) {
                Ok(identity) => identity,
                Err(reason) => {
                    trace!(%occurrence, %reason, "Skipping occurrence");
                    self.ledger.forget(occurrence);
                    continue;
                }
            };
            self.ledger.track(occurrence, &identity, &text);

            let retry_eligible = match self.registry.lookup(&identity) {
                None => {
                    self.registry.create_if_absent(&identity, &text);
                    true
                }
                Some(record) => {
                    !record.user_overridden() && matches!(record.status(), Status::New | Status::Error)
                }
            };
            if retry_eligible && self.enqueue(&identity) {
                report.enqueued += 1;
            }

            let desired = match self.registry.lookup(&identity) {
                Some(record) => RenderState::for_record(record),
                None => continue,
            };
            report.render_commands += self.apply(dom, occurrence, desired);
        }

        if report.enqueued > 0 || report.render_commands > 0 {
            info!(
                occurrences = report.occurrences,
                enqueued = report.enqueued,
                render_commands = report.render_commands,
                pending = self.queue.pending_len(),
                "Scan completed"
            );
        } else {
            debug!(occurrences = report.occurrences, "Scan completed with no changes");
        }
        self.events.emit_lossy(ModerationEvent::ScanCompleted {
            occurrences: report.occurrences,
            enqueued: report.enqueued,
            render_commands: report.render_commands,
            timestamp: chrono::Utc::now(),
        });

        report
    }

    /// Re-render every occurrence of `identity` from its record, in one pass
    ///
    /// Returns the number of occurrences of that identity.
    pub fn reconcile_identity<D: DomSource>(&mut self, dom: &mut D, identity: &CommentId) -> usize {
        let Some(desired) = self.registry.lookup(identity).map(RenderState::for_record) else {
            return 0;
        };
        let occurrences = self.ledger.occurrences_of(identity);
        for occurrence in &occurrences {
            self.apply(dom, *occurrence, desired);
        }
        occurrences.len()
    }

    /// Hand the next queue entry to the classifier, if the slot is free
    pub fn dispatch_next(&mut self) -> Option<QueueEntry> {
        while let Some(entry) = self.queue.dispatch_next() {
            if self.registry.mark_in_flight(&entry.identity).is_err() {
                // Registry already logged it; free the slot and move on
                self.queue.complete(&entry.identity);
                continue;
            }
            self.events.emit_lossy(ModerationEvent::RequestDispatched {
                identity: entry.identity.to_string(),
                pending: self.queue.pending_len(),
                timestamp: chrono::Utc::now(),
            });
            return Some(entry);
        }
        None
    }

    /// Resolve the in-flight entry with the classifier's result
    ///
    /// Every outcome clears the in-flight slot. On success the verdict is
    /// reconciled onto all occurrences; any failure marks the entry `error`,
    /// which restores its occurrences to their original text.
    pub fn complete<D: DomSource>(
        &mut self,
        dom: &mut D,
        entry: &QueueEntry,
        result: std::result::Result<ClassificationOutcome, ClassifierError>,
    ) -> Result<Classification> {
        self.queue.complete(&entry.identity);

        let resolved = match result {
            Ok(outcome) if outcome.identity == entry.identity => self.apply_verdict(dom, outcome),
            Ok(outcome) => {
                warn!(
                    requested = %entry.identity.short(),
                    answered = %outcome.identity.short(),
                    "Classifier answered for an identity that is not in flight"
                );
                self.events.emit_lossy(ModerationEvent::ResultDiscarded {
                    identity: outcome.identity.to_string(),
                    reason: "identity not in flight".to_string(),
                    timestamp: chrono::Utc::now(),
                });
                Err(Error::LateOrUnknownResult(outcome.identity))
            }
            Err(err) => Err(Error::from(err)),
        };

        if let Err(err) = &resolved {
            if self.registry.lookup(&entry.identity).map(|r| r.status()) == Some(Status::InFlight) {
                self.fail(dom, &entry.identity, err);
            }
        }

        if let Some(drained) = self.queue.take_drain_report() {
            info!(
                completed = drained.completed,
                elapsed_ms = drained.elapsed.as_millis() as u64,
                "Classification queue drained"
            );
            self.events.emit_lossy(ModerationEvent::QueueDrained {
                completed: drained.completed,
                duration_ms: drained.elapsed.as_millis() as u64,
                timestamp: chrono::Utc::now(),
            });
        }

        resolved
    }

    /// True if a text change on `occurrence` warrants a rescan
    ///
    /// Only occurrences the pipeline has not drawn yet, or whose last
    /// classification failed, can carry new content worth looking at; any
    /// other change is the pipeline's own rendering.
    pub fn needs_rescan(&self, occurrence: OccurrenceId) -> bool {
        match self.ledger.get(occurrence) {
            None => true,
            Some(rendering) => matches!(rendering.state, None | Some(RenderState::ErrorRestored)),
        }
    }

    pub fn forget_occurrence(&mut self, occurrence: OccurrenceId) {
        if self.ledger.forget(occurrence).is_some() {
            trace!(%occurrence, "Occurrence removed");
        }
    }

    fn enqueue(&mut self, identity: &CommentId) -> bool {
        let Some(text) = self.registry.lookup(identity).map(|r| r.original_text().to_string()) else {
            return false;
        };
        if self.registry.mark_queued(identity).is_err() {
            return false;
        }
        let entry = QueueEntry::new(identity.clone(), text, self.stream_id.clone());
        if !self.queue.enqueue(entry) {
            return false;
        }
        debug!(identity = %identity.short(), "Comment queued for classification");
        self.events.emit_lossy(ModerationEvent::CommentQueued {
            identity: identity.to_string(),
            timestamp: chrono::Utc::now(),
        });
        true
    }

    fn apply_verdict<D: DomSource>(&mut self, dom: &mut D, outcome: ClassificationOutcome) -> Result<Classification> {
        let classification = match self.registry.mark_classified(&outcome.identity, outcome.classification) {
            Ok(record) => record.classification(),
            Err(err) => {
                self.events.emit_lossy(ModerationEvent::ResultDiscarded {
                    identity: outcome.identity.to_string(),
                    reason: err.to_string(),
                    timestamp: chrono::Utc::now(),
                });
                return Err(err.into());
            }
        };

        let occurrences = self.reconcile_identity(dom, &outcome.identity);
        info!(
            identity = %outcome.identity.short(),
            %classification,
            occurrences,
            reason = outcome.reason.as_deref().unwrap_or(""),
            "Classification applied"
        );
        self.events.emit_lossy(ModerationEvent::ClassificationApplied {
            identity: outcome.identity.to_string(),
            classification,
            occurrences,
            timestamp: chrono::Utc::now(),
        });
        Ok(classification)
    }

    fn fail<D: DomSource>(&mut self, dom: &mut D, identity: &CommentId, err: &Error) {
        if self.registry.mark_error(identity).is_err() {
            return;
        }
        let occurrences = self.reconcile_identity(dom, identity);
        warn!(
            identity = %identity.short(),
            error = %err,
            occurrences,
            "Classification failed; comment is eligible for retry"
        );
        self.events.emit_lossy(ModerationEvent::ClassificationFailed {
            identity: identity.to_string(),
            error: err.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Draw `desired` on one occurrence unless it is already showing
    fn apply<D: DomSource>(&mut self, dom: &mut D, occurrence: OccurrenceId, desired: RenderState) -> usize {
        let Some(rendering) = self.ledger.entries.get_mut(&occurrence) else {
            return 0;
        };

        let mut commands = Vec::new();
        if rendering.state != Some(desired) {
            commands = desired.commands(&rendering.text);
            rendering.state = Some(desired);
        }
        if !rendering.report_attached {
            commands.push(RenderCommand::AttachReportControl);
            rendering.report_attached = true;
        }

        let issued = commands.len();
        for command in commands {
            dom.render(occurrence, command);
        }
        issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MemoryDom;

    fn reconciler() -> Reconciler {
        Reconciler::new(IdentityDeriver::default(), "stream", EventBus::new(64))
    }

    fn outcome(entry: &QueueEntry, classification: Classification) -> std::result::Result<ClassificationOutcome, ClassifierError> {
        Ok(ClassificationOutcome {
            identity: entry.identity.clone(),
            classification,
            reason: None,
        })
    }

    #[test]
    fn test_first_sight_renders_checking_and_enqueues() {
        let mut dom = MemoryDom::default();
        let occ = dom.add("hello");
        let mut reconciler = reconciler();

        let report = reconciler.scan(&mut dom);
        assert_eq!(report.occurrences, 1);
        assert_eq!(report.enqueued, 1);
        assert_eq!(
            dom.commands(),
            vec![
                (occ, RenderCommand::RenderChecking { text: "hello".to_string() }),
                (occ, RenderCommand::AttachReportControl),
            ]
        );

        let identity = reconciler.ledger().identity_of(occ).unwrap().clone();
        assert_eq!(reconciler.registry().lookup(&identity).unwrap().status(), Status::Queued);
        assert_eq!(reconciler.queue().pending_len(), 1);
    }

    #[test]
    fn test_scan_is_idempotent() {
        let mut dom = MemoryDom::default();
        dom.add("hello");
        dom.add("world");
        let mut reconciler = reconciler();

        reconciler.scan(&mut dom);
        let commands = dom.command_count();

        let second = reconciler.scan(&mut dom);
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.render_commands, 0);
        assert_eq!(dom.command_count(), commands);
        assert_eq!(reconciler.queue().pending_len(), 2);
    }

    #[test]
    fn test_placeholders_and_blank_text_skipped() {
        let mut dom = MemoryDom::default();
        let display = cmod_common::config::DisplayConfig::default();
        dom.add(&display.checking_text);
        dom.add(&display.censored_text);
        dom.add("   ");
        let mut reconciler = reconciler();

        let report = reconciler.scan(&mut dom);
        assert_eq!(report.occurrences, 3);
        assert_eq!(report.enqueued, 0);
        assert_eq!(report.render_commands, 0);
        assert!(reconciler.registry().is_empty());
    }

    #[test]
    fn test_verdict_renders_every_occurrence() {
        let mut dom = MemoryDom::default();
        let first = dom.add("spam spam");
        let second = dom.add("spam spam");
        let mut reconciler = reconciler();

        assert_eq!(reconciler.scan(&mut dom).enqueued, 1);
        let entry = reconciler.dispatch_next().unwrap();
        assert!(reconciler.dispatch_next().is_none());

        let applied = reconciler
            .complete(&mut dom, &entry, outcome(&entry, Classification::Flagged))
            .unwrap();
        assert_eq!(applied, Classification::Flagged);

        let display = cmod_common::config::DisplayConfig::default();
        for occ in [first, second] {
            assert_eq!(dom.visible_text(occ).unwrap(), display.censored_text);
            assert_eq!(
                reconciler.ledger().get(occ).unwrap().state,
                Some(RenderState::Flagged)
            );
        }
    }

    #[test]
    fn test_failure_restores_original_and_retries_on_next_scan() {
        let mut dom = MemoryDom::default();
        let occ = dom.add("hello");
        let mut reconciler = reconciler();
        reconciler.scan(&mut dom);

        let entry = reconciler.dispatch_next().unwrap();
        let err = reconciler
            .complete(&mut dom, &entry, Err(ClassifierError::Network("refused".into())))
            .unwrap_err();
        assert!(matches!(err, Error::TransportFailure(_)));
        assert_eq!(dom.visible_text(occ).unwrap(), "hello");
        assert!(reconciler.needs_rescan(occ));

        let report = reconciler.scan(&mut dom);
        assert_eq!(report.enqueued, 1);
        assert_eq!(reconciler.scan(&mut dom).enqueued, 0);

        let retry = reconciler.dispatch_next().unwrap();
        assert_eq!(retry.identity, entry.identity);
        assert_eq!(reconciler.registry().lookup(&retry.identity).unwrap().attempts(), 2);
    }

    #[test]
    fn test_foreign_identity_is_discarded() {
        let mut dom = MemoryDom::default();
        dom.add("hello");
        let mut reconciler = reconciler();
        reconciler.scan(&mut dom);
        let entry = reconciler.dispatch_next().unwrap();

        let foreign = Ok(ClassificationOutcome {
            identity: CommentId::from_wire("pseudo--stream--other"),
            classification: Classification::Flagged,
            reason: None,
        });
        let err = reconciler.complete(&mut dom, &entry, foreign).unwrap_err();
        assert!(matches!(err, Error::LateOrUnknownResult(_)));

        let record = reconciler.registry().lookup(&entry.identity).unwrap();
        assert_eq!(record.status(), Status::Error);
        assert!(!reconciler.queue().is_in_flight());
    }

    #[test]
    fn test_removed_occurrence_is_pruned() {
        let mut dom = MemoryDom::default();
        let occ = dom.add("hello");
        let mut reconciler = reconciler();
        reconciler.scan(&mut dom);
        assert_eq!(reconciler.ledger().len(), 1);

        dom.remove(occ);
        reconciler.scan(&mut dom);
        assert!(reconciler.ledger().is_empty());
    }

    #[test]
    fn test_recycled_occurrence_starts_over() {
        let mut dom = MemoryDom::default();
        let occ = dom.add("hello");
        let mut reconciler = reconciler();
        reconciler.scan(&mut dom);
        let before = reconciler.ledger().identity_of(occ).unwrap().clone();

        dom.replace_text(occ, "a different comment");
        let report = reconciler.scan(&mut dom);
        assert_eq!(report.enqueued, 1);
        assert_ne!(reconciler.ledger().identity_of(occ).unwrap(), &before);
        assert!(reconciler.ledger().get(occ).unwrap().report_attached);
    }

    #[test]
    fn test_drain_emits_event() {
        let mut dom = MemoryDom::default();
        dom.add("hello");
        let mut reconciler = reconciler();
        let mut rx = reconciler.events().subscribe();
        reconciler.scan(&mut dom);

        let entry = reconciler.dispatch_next().unwrap();
        reconciler
            .complete(&mut dom, &entry, outcome(&entry, Classification::Normal))
            .unwrap();

        let mut drained = false;
        while let Ok(event) = rx.try_recv() {
            if let ModerationEvent::QueueDrained { completed, .. } = event {
                assert_eq!(completed, 1);
                drained = true;
            }
        }
        assert!(drained);
    }
}
