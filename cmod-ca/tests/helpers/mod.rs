//! Shared fixtures for cmod-ca integration tests
//!
//! A scripted in-process classifier and a harness that runs the moderator on
//! its own task while the test drives DOM signals and user actions.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cmod_ca::classifier::{ClassificationOutcome, Classifier, ClassifierError};
use cmod_ca::dom::{DomSignal, MemoryDom};
use cmod_ca::queue::QueueEntry;
use cmod_ca::{CommentModerator, UserAction};
use cmod_common::config::TomlConfig;
use cmod_common::events::{EventBus, ModerationEvent};
use cmod_common::protocol::{Classification, ReportWordRequest};

/// Scripted reply for one classify call
#[derive(Debug, Clone)]
pub enum FakeReply {
    Verdict(Classification),
    /// Answer for a different identity than the one asked about
    ForeignIdentity(String),
    Fail(ClassifierError),
}

/// In-process classifier with per-text scripted replies
///
/// Texts without a script get the default verdict. Tracks how many calls
/// are running at once.
pub struct FakeClassifier {
    default: Classification,
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<FakeReply>>>,
    calls: Mutex<Vec<QueueEntry>>,
    reports: Mutex<Vec<ReportWordRequest>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeClassifier {
    pub fn new(default: Classification) -> Self {
        Self {
            default,
            delay: Duration::from_millis(50),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue replies for `text`, consumed one per call
    pub fn script(&self, text: &str, replies: Vec<FakeReply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(text.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn calls(&self) -> Vec<QueueEntry> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, text: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|e| e.text == text).count()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<ReportWordRequest> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, entry: &QueueEntry) -> Result<ClassificationOutcome, ClassifierError> {
        self.calls.lock().unwrap().push(entry.clone());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&entry.text)
            .and_then(|replies| replies.pop_front())
            .unwrap_or(FakeReply::Verdict(self.default));

        match reply {
            FakeReply::Verdict(classification) => Ok(ClassificationOutcome {
                identity: entry.identity.clone(),
                classification,
                reason: None,
            }),
            FakeReply::ForeignIdentity(token) => Ok(ClassificationOutcome {
                identity: cmod_ca::CommentId::from_wire(token),
                classification: Classification::Flagged,
                reason: None,
            }),
            FakeReply::Fail(err) => Err(err),
        }
    }

    async fn report_word(&self, report: &ReportWordRequest) -> Result<(), ClassifierError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Moderator running on a background task
pub struct Harness {
    pub dom: MemoryDom,
    pub classifier: Arc<FakeClassifier>,
    pub signals: mpsc::Sender<DomSignal>,
    pub actions: mpsc::Sender<UserAction>,
    pub events: broadcast::Receiver<ModerationEvent>,
    shutdown: CancellationToken,
    handle: JoinHandle<CommentModerator<MemoryDom, FakeClassifier>>,
}

impl Harness {
    pub fn start(dom: MemoryDom, classifier: FakeClassifier) -> Self {
        Self::start_with_config(dom, classifier, &TomlConfig::default())
    }

    pub fn start_with_config(dom: MemoryDom, classifier: FakeClassifier, config: &TomlConfig) -> Self {
        let classifier = Arc::new(classifier);
        let bus = EventBus::new(1024);
        let events = bus.subscribe();
        let moderator = CommentModerator::new(dom.clone(), Arc::clone(&classifier), "stream", config, bus);

        let (signals, signal_rx) = mpsc::channel(64);
        let (actions, action_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(moderator.run(signal_rx, action_rx, shutdown.clone()));

        Self {
            dom,
            classifier,
            signals,
            actions,
            events,
            shutdown,
            handle,
        }
    }

    pub async fn signal(&self, signal: DomSignal) {
        self.signals.send(signal).await.unwrap();
    }

    /// Wait (up to a minute of runtime clock) for an event matching `pred`
    pub async fn wait_for<F>(&mut self, pred: F) -> ModerationEvent
    where
        F: Fn(&ModerationEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Events already delivered, without waiting
    pub fn drain_events(&mut self) -> Vec<ModerationEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }

    pub async fn stop(self) -> CommentModerator<MemoryDom, FakeClassifier> {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}

pub fn is_drained(event: &ModerationEvent) -> bool {
    matches!(event, ModerationEvent::QueueDrained { .. })
}

pub fn is_scan(event: &ModerationEvent) -> bool {
    matches!(event, ModerationEvent::ScanCompleted { .. })
}
