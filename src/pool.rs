//! Fixed-size worker pool with a blocking hand-off
//!
//! N scoped worker threads pull tasks from a zero-capacity channel, each
//! through its own receiver clone. A producer's `submit` only returns once an
//! idle worker has taken the task, so at most N tasks run at once and a
//! saturated pool stalls the producer. `run` returns after every worker has
//! finished its last task.

use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Counters collected over one `run`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub dispatched: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

/// Hands tasks to the pool from inside the producer closure
pub struct Submitter<T> {
    tx: Sender<T>,
}

impl<T> Submitter<T> {
    /// Block until a worker accepts `task`. Returns it back if no worker is left.
    pub fn submit(&self, task: T) -> Result<(), T> {
        self.tx.send(task).map_err(|e| e.0)
    }
}

/// Tracks tasks currently executing and the highest count seen
#[derive(Default)]
struct InFlight {
    started: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct Permit<'a>(&'a InFlight);

impl InFlight {
    fn acquire(&self) -> Permit<'_> {
        self.started.fetch_add(1, Ordering::Relaxed);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Permit(self)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// A pool of `workers` threads; zero is treated as one
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Run `produce` on the calling thread while workers execute `work` for each submitted task
    pub fn run<T, P, W>(&self, produce: P, work: W) -> PoolStats
    where
        T: Send,
        P: FnOnce(&Submitter<T>),
        W: Fn(T) + Sync,
    {
        let (tx, rx) = bounded::<T>(0);
        let in_flight = InFlight::default();
        let submitter = Submitter { tx };

        thread::scope(|scope| {
            for _ in 0..self.workers {
                let rx = rx.clone();
                let work = &work;
                let in_flight = &in_flight;
                scope.spawn(move || {
                    for task in rx {
                        let _permit = in_flight.acquire();
                        work(task);
                    }
                });
            }
            // Only workers hold receivers, so `submit` fails if every worker is gone
            drop(rx);

            produce(&submitter);
            // Disconnect the channel so idle workers exit once the last task is taken
            drop(submitter);
        });

        PoolStats {
            dispatched: in_flight.started.into_inner(),
            peak_in_flight: in_flight.peak.into_inner(),
        }
    }
}
