//! Mailbox for work that must run on the tick thread
//!
//! Other threads hand closures to [`ActionQueue::enqueue`]; the tick loop
//! runs everything queued so far once per tick, in submission order.

use log::{error, warn};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ActionError(pub String);

impl ActionError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        ActionError(message.to_string())
    }
}

pub type Action<C> = Box<dyn FnOnce(&mut C) -> Result<(), ActionError> + Send>;

/// Result of one [`ActionQueue::run`] batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub executed: usize,
    pub failed: usize,
}

pub struct ActionQueue<C> {
    pending: Mutex<VecDeque<Action<C>>>,
}

impl<C> Default for ActionQueue<C> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }
}

impl<C> ActionQueue<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue<F>(&self, action: F)
    where
        F: FnOnce(&mut C) -> Result<(), ActionError> + Send + 'static,
    {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Box::new(action));
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every action queued before the call
    ///
    /// The queue is swapped out under the lock and executed without it, so
    /// actions may enqueue more work; that work runs on the next call. A
    /// failing or panicking action is logged and the rest of the batch still
    /// runs.
    pub fn run(&self, context: &mut C) -> RunReport {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));

        let mut report = RunReport::default();
        for action in batch {
            report.executed += 1;
            match catch_unwind(AssertUnwindSafe(|| action(&mut *context))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!("Queued action failed: {}", e);
                }
                Err(_) => {
                    report.failed += 1;
                    error!("Queued action panicked");
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_runs_in_submission_order() {
        let queue: ActionQueue<Vec<u32>> = ActionQueue::new();
        for i in 0..5 {
            queue.enqueue(move |log: &mut Vec<u32>| {
                log.push(i);
                Ok(())
            });
        }
        assert_eq!(queue.len(), 5);

        let mut log = Vec::new();
        let report = queue.run(&mut log);
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
        assert_eq!(report, RunReport { executed: 5, failed: 0 });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failure_does_not_stop_the_batch() {
        let queue: ActionQueue<Vec<&'static str>> = ActionQueue::new();
        queue.enqueue(|log: &mut Vec<&'static str>| {
            log.push("first");
            Ok(())
        });
        queue.enqueue(|_: &mut Vec<&'static str>| Err(ActionError::new("boom")));
        queue.enqueue(|_: &mut Vec<&'static str>| panic!("worse"));
        queue.enqueue(|log: &mut Vec<&'static str>| {
            log.push("last");
            Ok(())
        });

        let mut log = Vec::new();
        let report = queue.run(&mut log);
        assert_eq!(log, vec!["first", "last"]);
        assert_eq!(report.failed, 2);

        queue.enqueue(|log: &mut Vec<&'static str>| {
            log.push("next tick");
            Ok(())
        });
        queue.run(&mut log);
        assert_eq!(log.last(), Some(&"next tick"));
    }

    #[test]
    fn test_enqueue_from_other_threads() {
        let queue: Arc<ActionQueue<u64>> = Arc::new(ActionQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        queue.enqueue(|sum: &mut u64| {
                            *sum += 1;
                            Ok(())
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut sum = 0;
        queue.run(&mut sum);
        assert_eq!(sum, 400);
    }
}
