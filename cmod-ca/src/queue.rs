//! Serialized classification request queue
//!
//! FIFO list of pending entries plus a single in-flight slot. At most one
//! entry is being serviced at any time, which bounds outstanding load on the
//! classifier to one request and keeps results arriving in submission order.
//! Dispatch is level-triggered: calling `dispatch_next` whenever the slot is
//! free drains the queue, and a missed call heals on the next one.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use cmod_common::protocol::ClassifyRequest;

use crate::identity::CommentId;

/// One classification request waiting for (or occupying) the in-flight slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub identity: CommentId,
    pub text: String,
    pub stream_id: String,
}

impl QueueEntry {
    pub fn new(identity: CommentId, text: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            identity,
            text: text.into(),
            stream_id: stream_id.into(),
        }
    }

    /// Wire request for this entry
    pub fn to_request(&self) -> ClassifyRequest {
        ClassifyRequest::single(self.identity.as_str(), self.text.clone(), self.stream_id.clone())
    }
}

/// Summary of one fill-to-empty cycle of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub elapsed: Duration,
}

/// FIFO request queue with a single in-flight slot
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: VecDeque<QueueEntry>,
    in_flight: Option<QueueEntry>,
    /// Set by the first enqueue into an idle queue
    fill_started: Option<Instant>,
    completed_since_fill: usize,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    ///
    /// Returns false (and drops the entry) if its identity is already pending
    /// or in flight.
    pub fn enqueue(&mut self, entry: QueueEntry) -> bool {
        if self.contains(&entry.identity) {
            debug!(identity = %entry.identity.short(), "Identity already queued, not enqueuing again");
            return false;
        }

        if self.is_idle() && self.fill_started.is_none() {
            self.fill_started = Some(Instant::now());
            self.completed_since_fill = 0;
        }

        self.pending.push_back(entry);
        true
    }

    /// Move the oldest pending entry into the in-flight slot
    ///
    /// No-op (returns None) while a request is in flight or nothing is pending.
    pub fn dispatch_next(&mut self) -> Option<QueueEntry> {
        if self.in_flight.is_some() {
            return None;
        }
        let entry = self.pending.pop_front()?;
        debug!(
            identity = %entry.identity.short(),
            remaining = self.pending.len(),
            "Dispatching next queue entry"
        );
        self.in_flight = Some(entry.clone());
        Some(entry)
    }

    /// Clear the in-flight slot for `identity`
    ///
    /// Returns the completed entry, or None if `identity` is not the entry in flight.
    pub fn complete(&mut self, identity: &CommentId) -> Option<QueueEntry> {
        match &self.in_flight {
            Some(entry) if &entry.identity == identity => {
                self.completed_since_fill += 1;
                self.in_flight.take()
            }
            Some(entry) => {
                warn!(
                    completed = %identity.short(),
                    in_flight = %entry.identity.short(),
                    "Completion does not match the in-flight entry"
                );
                None
            }
            None => {
                warn!(completed = %identity.short(), "Completion with nothing in flight");
                None
            }
        }
    }

    /// Report (once) that the queue has drained since it last started filling
    pub fn take_drain_report(&mut self) -> Option<DrainReport> {
        if !self.is_idle() {
            return None;
        }
        let started = self.fill_started.take()?;
        let report = DrainReport {
            completed: self.completed_since_fill,
            elapsed: started.elapsed(),
        };
        self.completed_since_fill = 0;
        Some(report)
    }

    pub fn contains(&self, identity: &CommentId) -> bool {
        self.in_flight.as_ref().is_some_and(|e| &e.identity == identity)
            || self.pending.iter().any(|e| &e.identity == identity)
    }

    pub fn in_flight(&self) -> Option<&QueueEntry> {
        self.in_flight.as_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Nothing pending and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(s: &str) -> QueueEntry {
        QueueEntry::new(CommentId::from_wire(s), s, "stream")
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = RequestQueue::new();
        assert!(queue.enqueue(entry("a")));
        assert!(queue.enqueue(entry("b")));
        assert!(queue.enqueue(entry("c")));

        let mut order = Vec::new();
        while let Some(e) = queue.dispatch_next() {
            order.push(e.identity.to_string());
            queue.complete(&e.identity).unwrap();
        }
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_single_in_flight() {
        let mut queue = RequestQueue::new();
        queue.enqueue(entry("a"));
        queue.enqueue(entry("b"));

        let first = queue.dispatch_next().unwrap();
        assert!(queue.dispatch_next().is_none());
        assert!(queue.dispatch_next().is_none());
        assert_eq!(queue.pending_len(), 1);

        queue.complete(&first.identity).unwrap();
        assert_eq!(queue.dispatch_next().unwrap().identity.as_str(), "b");
    }

    #[test]
    fn test_no_duplicates_while_pending_or_in_flight() {
        let mut queue = RequestQueue::new();
        assert!(queue.enqueue(entry("a")));
        assert!(!queue.enqueue(entry("a")));

        let a = queue.dispatch_next().unwrap();
        assert!(!queue.enqueue(entry("a")));

        queue.complete(&a.identity).unwrap();
        assert!(queue.enqueue(entry("a")));
    }

    #[test]
    fn test_mismatched_completion_keeps_slot() {
        let mut queue = RequestQueue::new();
        queue.enqueue(entry("a"));
        queue.dispatch_next().unwrap();

        assert!(queue.complete(&CommentId::from_wire("other")).is_none());
        assert!(queue.is_in_flight());
    }

    #[test]
    fn test_dispatch_empty_is_noop() {
        let mut queue = RequestQueue::new();
        assert!(queue.dispatch_next().is_none());
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn test_wire_request() {
        let request = entry("a").to_request();
        assert_eq!(request.comments.len(), 1);
        assert_eq!(request.comments[0].id, "a");
        assert_eq!(request.comments[0].stream_id, "stream");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_report() {
        let mut queue = RequestQueue::new();
        assert!(queue.take_drain_report().is_none());

        queue.enqueue(entry("a"));
        queue.enqueue(entry("b"));
        assert!(queue.take_drain_report().is_none());

        tokio::time::advance(Duration::from_millis(1500)).await;
        while let Some(e) = queue.dispatch_next() {
            queue.complete(&e.identity);
        }

        let report = queue.take_drain_report().unwrap();
        assert_eq!(report.completed, 2);
        assert!(report.elapsed >= Duration::from_millis(1500));

        // Reported once per cycle
        assert!(queue.take_drain_report().is_none());
    }
}
