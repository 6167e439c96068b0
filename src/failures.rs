//! Bounded, lossy queue of failed transfers awaiting their single retry
//!
//! Workers `offer` failed tasks without ever blocking. When the queue is
//! full the task is dropped and reported through the logger. `close` takes
//! the queue by value, so it can only run once every worker borrowing it has
//! finished.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::logger::Logger;
use crate::transfer::TransferTask;

/// Default number of failures held for the retry pass
pub const DEFAULT_RETRY_CAPACITY: usize = 100;

pub struct FailureQueue {
    tx: Sender<TransferTask>,
    rx: Receiver<TransferTask>,
    dropped: Mutex<Vec<TransferTask>>,
}

impl FailureQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Mutex::new(Vec::new()),
        }
    }

    /// Tasks accepted so far; nothing is taken out before `close`
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped.lock().len()
    }

    /// Enqueue without blocking; a full queue drops the task and logs it
    pub fn offer(&self, task: TransferTask, logger: &dyn Logger) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                logger.retry_dropped(&task);
                self.dropped.lock().push(task);
                false
            }
        }
    }

    pub fn close(self) -> ClosedFailureQueue {
        drop(self.tx);
        ClosedFailureQueue {
            rx: self.rx,
            dropped: self.dropped.into_inner(),
        }
    }
}

/// No more writers; drained exactly once by the retry pass
pub struct ClosedFailureQueue {
    rx: Receiver<TransferTask>,
    dropped: Vec<TransferTask>,
}

impl ClosedFailureQueue {
    /// Yield queued tasks in enqueue order, plus the tasks lost to overflow
    pub fn drain(self) -> (impl Iterator<Item = TransferTask>, Vec<TransferTask>) {
        (self.rx.into_iter(), self.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{LogEvent, MemoryLogger, NoopLogger};
    use std::path::PathBuf;

    fn task(n: usize) -> TransferTask {
        TransferTask::new(format!("/remote/{n}"), format!("/local/{n}"))
    }

    #[test]
    fn drains_in_enqueue_order_after_close() {
        let queue = FailureQueue::with_capacity(4);
        for n in 0..3 {
            assert!(queue.offer(task(n), &NoopLogger));
        }

        assert_eq!(queue.queued(), 3);
        let (items, dropped) = queue.close().drain();
        assert_eq!(items.collect::<Vec<_>>(), vec![task(0), task(1), task(2)]);
        assert!(dropped.is_empty());
    }

    #[test]
    fn overflow_drops_and_logs_each_task() {
        let queue = FailureQueue::with_capacity(1);
        let logger = MemoryLogger::new();

        assert!(queue.offer(task(0), &logger));
        assert!(!queue.offer(task(1), &logger));
        assert!(!queue.offer(task(2), &logger));

        assert_eq!(
            logger.events(),
            vec![
                LogEvent::RetryDropped(PathBuf::from("/remote/1")),
                LogEvent::RetryDropped(PathBuf::from("/remote/2")),
            ]
        );

        assert_eq!(queue.queued(), 1);
        assert_eq!(queue.dropped_count(), 2);
        let (items, dropped) = queue.close().drain();
        assert_eq!(items.collect::<Vec<_>>(), vec![task(0)]);
        assert_eq!(dropped, vec![task(1), task(2)]);
    }

    #[test]
    fn empty_queue_drains_to_nothing() {
        let (items, dropped) = FailureQueue::with_capacity(10).close().drain();
        assert_eq!(items.count(), 0);
        assert!(dropped.is_empty());
    }

    #[test]
    fn concurrent_offers_never_block() {
        let queue = FailureQueue::with_capacity(8);
        let logger = MemoryLogger::new();

        std::thread::scope(|s| {
            for t in 0..4 {
                let queue = &queue;
                let logger = &logger;
                s.spawn(move || {
                    for n in 0..10 {
                        queue.offer(task(t * 10 + n), logger);
                    }
                });
            }
        });

        assert_eq!(queue.queued(), 8);
        let (items, dropped) = queue.close().drain();
        assert_eq!(items.count(), 8);
        assert_eq!(dropped.len(), 32);
        assert_eq!(logger.count(|e| matches!(e, LogEvent::RetryDropped(_))), 32);
    }
}
