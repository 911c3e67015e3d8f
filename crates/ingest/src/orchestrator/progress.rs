//! Progress events published during a run

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Mutex, PoisonError};

use crate::models::{Category, CategoryState};
use crate::tracker::CategoryTracker;

/// Top-level run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    NotStarted,
    Triggering,
    /// Direct saves and inbox polling in flight
    Concurrent,
    Finalizing,
    Done,
}

/// One progress update
///
/// `percent` is advisory: it tracks the share of categories in a terminal
/// state and never decreases within a run.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub message: String,
    pub percent: u8,
    pub phase: RunPhase,
    pub snapshot: BTreeMap<Category, CategoryState>,
}

/// Fans events out to subscribers
#[derive(Default)]
pub(crate) struct ProgressPublisher {
    subscribers: Mutex<Vec<Sender<ProgressEvent>>>,
    percent: AtomicU8,
}

impl ProgressPublisher {
    pub fn subscribe(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Start a new run at 0%
    pub fn reset(&self) {
        self.percent.store(0, Ordering::SeqCst);
    }

    pub fn publish(&self, phase: RunPhase, message: impl Into<String>, tracker: &CategoryTracker) {
        // Held across compute and send so concurrent publishers stay ordered
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let computed = if phase == RunPhase::Done {
            100
        } else {
            percent_complete(tracker.terminal_count(), tracker.total())
        };
        let previous = self.percent.fetch_max(computed, Ordering::SeqCst);

        let event = ProgressEvent {
            message: message.into(),
            percent: previous.max(computed),
            phase,
            snapshot: tracker.snapshot(),
        };

        // Drop subscribers that hung up
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn percent_complete(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryMethod;

    #[test]
    fn test_percent_complete() {
        assert_eq!(percent_complete(0, 0), 0);
        assert_eq!(percent_complete(1, 3), 33);
        assert_eq!(percent_complete(3, 3), 100);
    }

    #[test]
    fn test_events_carry_snapshot_and_never_decrease() {
        let tracker = CategoryTracker::new(&[Category::Orders, Category::NewCustomers]);
        let publisher = ProgressPublisher::default();
        let rx = publisher.subscribe();

        tracker
            .set(
                Category::Orders,
                CategoryState::Saved {
                    record_count: 2,
                    delivery: DeliveryMethod::Direct,
                },
            )
            .unwrap();
        publisher.publish(RunPhase::Concurrent, "saved orders", &tracker);

        let event = rx.recv().unwrap();
        assert_eq!(event.percent, 50);
        assert_eq!(event.phase, RunPhase::Concurrent);
        assert!(event.snapshot[&Category::Orders].is_saved());

        // A fresh tracker would compute 0%, the published value must not drop
        let empty = CategoryTracker::new(&[Category::Orders, Category::NewCustomers]);
        publisher.publish(RunPhase::Finalizing, "finalizing", &empty);
        assert_eq!(rx.recv().unwrap().percent, 50);

        publisher.publish(RunPhase::Done, "done", &empty);
        assert_eq!(rx.recv().unwrap().percent, 100);
    }

    #[test]
    fn test_dropped_subscriber_is_removed() {
        let tracker = CategoryTracker::new(&[Category::Orders]);
        let publisher = ProgressPublisher::default();
        drop(publisher.subscribe());

        publisher.publish(RunPhase::Triggering, "triggering", &tracker);
        assert!(publisher.subscribers.lock().unwrap().is_empty());
    }
}
