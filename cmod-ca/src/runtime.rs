//! Event-driven moderation runtime
//!
//! A single task owns the whole pipeline. DOM signals arm the debouncer,
//! the debounce deadline triggers a scan, at most one classifier future is
//! polled at a time and user actions are applied in between. Because every
//! handler takes `&mut self`, neither a scan nor a dispatch can start while
//! another one is running.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cmod_common::config::TomlConfig;
use cmod_common::events::{EventBus, ModerationEvent};

use crate::classifier::{ClassificationOutcome, Classifier, ClassifierError};
use crate::debounce::Debouncer;
use crate::dom::{DomSignal, DomSource, OccurrenceId};
use crate::error::{Error, Result};
use crate::identity::IdentityDeriver;
use crate::queue::{QueueEntry, RequestQueue};
use crate::reconcile::{Reconciler, ScanReport};
use crate::registry::CommentRegistry;

pub type ClassifyResult = std::result::Result<ClassificationOutcome, ClassifierError>;
pub type InFlight = BoxFuture<'static, (QueueEntry, ClassifyResult)>;

/// User-initiated actions on a rendered occurrence
#[derive(Debug)]
pub enum UserAction {
    Reveal(OccurrenceId),
    HideAgain(OccurrenceId),
    RestoreNormal(OccurrenceId),
    ReportWord {
        occurrence: OccurrenceId,
        word: String,
        reason: String,
        /// Outcome of the report, delivered to the initiating action only
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Comment moderation pipeline bound to one DOM source and one classifier
pub struct CommentModerator<D, C: ?Sized> {
    reconciler: Reconciler,
    dom: D,
    classifier: Arc<C>,
    debouncer: Debouncer,
    container_poll: Duration,
}

impl<D, C> CommentModerator<D, C>
where
    D: DomSource + Send,
    C: Classifier + ?Sized + 'static,
{
    pub fn new(
        dom: D,
        classifier: Arc<C>,
        stream_id: impl Into<String>,
        config: &TomlConfig,
        events: EventBus,
    ) -> Self {
        let deriver = IdentityDeriver::from_config(&config.pipeline, &config.display);
        Self {
            reconciler: Reconciler::new(deriver, stream_id, events),
            dom,
            classifier,
            debouncer: Debouncer::new(config.pipeline.debounce()),
            container_poll: config.pipeline.container_poll(),
        }
    }

    pub fn dom(&self) -> &D {
        &self.dom
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn registry(&self) -> &CommentRegistry {
        self.reconciler.registry()
    }

    pub fn queue(&self) -> &RequestQueue {
        self.reconciler.queue()
    }

    pub fn events(&self) -> &EventBus {
        self.reconciler.events()
    }

    /// Run one scan/reconcile sweep now
    pub fn scan(&mut self) -> ScanReport {
        self.reconciler.scan(&mut self.dom)
    }

    /// Start classifying the next queue entry, if nothing is in flight
    pub fn dispatch(&mut self) -> Option<InFlight> {
        let entry = self.reconciler.dispatch_next()?;
        let classifier = Arc::clone(&self.classifier);
        Some(Box::pin(async move {
            let result = classifier.classify(&entry).await;
            (entry, result)
        }))
    }

    /// Resolve the in-flight entry
    pub fn complete(&mut self, entry: &QueueEntry, result: ClassifyResult) {
        if let Err(err) = self.reconciler.complete(&mut self.dom, entry, result) {
            debug!(identity = %entry.identity.short(), error = %err, "Queue entry resolved without a verdict");
        }
    }

    /// React to a structural change notification
    pub fn handle_signal(&mut self, signal: DomSignal) {
        let relevant = match signal {
            DomSignal::OccurrencesAdded => true,
            DomSignal::OccurrenceRemoved(occurrence) => {
                self.reconciler.forget_occurrence(occurrence);
                false
            }
            DomSignal::TextChanged(occurrence) => self.reconciler.needs_rescan(occurrence),
        };

        if relevant {
            self.debouncer.touch();
        } else {
            trace!(?signal, "DOM signal needs no rescan");
        }
    }

    /// Apply a user action
    pub fn handle_action(&mut self, action: UserAction) {
        let outcome = match action {
            UserAction::Reveal(occurrence) => self.reconciler.reveal(&mut self.dom, occurrence).map(|_| ()),
            UserAction::HideAgain(occurrence) => self.reconciler.hide_again(&mut self.dom, occurrence).map(|_| ()),
            UserAction::RestoreNormal(occurrence) => {
                self.reconciler.restore_normal(&mut self.dom, occurrence).map(|_| ())
            }
            UserAction::ReportWord {
                occurrence,
                word,
                reason,
                reply,
            } => {
                self.report_word(occurrence, &word, &reason, reply);
                Ok(())
            }
        };

        if let Err(err) = outcome {
            warn!(error = %err, "User action rejected");
        }
    }

    /// Drive the pipeline until `shutdown` is cancelled
    ///
    /// Waits for the comment container, scans once, then serves signals,
    /// the debounce deadline, the in-flight request and user actions.
    /// Returns the moderator so callers can inspect final state.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<DomSignal>,
        mut actions: mpsc::Receiver<UserAction>,
        shutdown: CancellationToken,
    ) -> Self {
        if !self.wait_for_container(&shutdown).await {
            return self;
        }

        info!(stream_id = %self.reconciler.stream_id(), "Comment container found, starting moderation");
        self.scan();
        let mut in_flight = self.dispatch();
        let mut signals_open = true;
        let mut actions_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping moderation");
                    break;
                }

                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => self.handle_signal(signal),
                    None => {
                        debug!("DOM signal channel closed");
                        signals_open = false;
                    }
                },

                _ = self.debouncer.wait(), if self.debouncer.is_armed() => {
                    if self.debouncer.fire() {
                        self.scan();
                    }
                }

                (entry, result) = async {
                    match in_flight.as_mut() {
                        Some(request) => request.await,
                        None => std::future::pending().await,
                    }
                } => {
                    in_flight = None;
                    self.complete(&entry, result);
                }

                action = actions.recv(), if actions_open => match action {
                    Some(action) => self.handle_action(action),
                    None => {
                        debug!("User action channel closed");
                        actions_open = false;
                    }
                },
            }

            // Level-triggered: every turn of the loop tries to fill the slot
            if in_flight.is_none() {
                in_flight = self.dispatch();
            }
        }

        self
    }

    async fn wait_for_container(&self, shutdown: &CancellationToken) -> bool {
        let mut announced = false;
        while !self.dom.container_present() {
            if !announced {
                info!(
                    poll_ms = self.container_poll.as_millis() as u64,
                    "Waiting for comment container"
                );
                announced = true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.container_poll) => {}
            }
        }
        true
    }

    fn report_word(&self, occurrence: OccurrenceId, word: &str, reason: &str, reply: oneshot::Sender<Result<()>>) {
        let report = match self.reconciler.word_report(occurrence, word, reason) {
            Ok(report) => report,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };

        let classifier = Arc::clone(&self.classifier);
        let events = self.reconciler.events().clone();
        tokio::spawn(async move {
            let result = classifier.report_word(&report).await.map_err(Error::from);
            if let Err(err) = &result {
                warn!(word = %report.word, error = %err, "Word report failed");
            }
            events.emit_lossy(ModerationEvent::WordReported {
                word: report.word.clone(),
                success: result.is_ok(),
                timestamp: chrono::Utc::now(),
            });
            let _ = reply.send(result);
        });
    }
}
