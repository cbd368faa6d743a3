//! Trailing-edge debounce timer
//!
//! Every `touch` pushes the deadline out to `now + delay`, so a burst of
//! structural changes collapses into one scan after the burst goes quiet.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record activity, (re)arming the timer
    pub fn touch(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait for the armed deadline; pending forever while unarmed
    ///
    /// Cancel-safe: dropping the future leaves the timer untouched, so it can
    /// sit in a `select!` branch alongside the signal that re-arms it.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Disarm; returns true if the timer was armed and its deadline has passed
    pub fn fire(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
