//! Bounded-concurrency FIFO job queue
//!
//! A [`Limiter`] is a cheaply clonable handle. Every clone shares one queue,
//! so a single limiter passed to all connections bounds the total number of
//! jobs running at once across the process.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

thread_local! {
    /// Limiters whose queue is being drained further up this thread's stack
    static DRAINING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a limiter as draining on the current thread until dropped
struct DrainGuard(usize);

impl DrainGuard {
    fn enter(key: usize) -> Option<Self> {
        DRAINING.with(|draining| {
            let mut draining = draining.borrow_mut();
            if draining.contains(&key) {
                return None;
            }
            draining.push(key);
            Some(Self(key))
        })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let _ = DRAINING.try_with(|draining| draining.borrow_mut().retain(|k| *k != self.0));
    }
}

/// Default number of concurrently running compression jobs
pub const DEFAULT_CONCURRENCY: usize = 10;

/// A unit of work; it must eventually call [`Done::done`] (or drop the handle)
pub type Job = Box<dyn FnOnce(Done) + Send + 'static>;

struct State {
    concurrency: usize,
    pending: usize,
    queue: VecDeque<Job>,
}

/// Shared handle to a FIFO queue that runs at most `concurrency` jobs at once
#[derive(Clone)]
pub struct Limiter {
    state: Arc<Mutex<State>>,
}

impl Limiter {
    /// Create a limiter running at most `concurrency` jobs at once
    ///
    /// A concurrency of 0 queues jobs forever without running any.
    pub fn new(concurrency: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                concurrency,
                pending: 0,
                queue: VecDeque::new(),
            })),
        }
    }

    /// Create a limiter that runs every job immediately
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Append a job to the queue and start it if a slot is free
    pub fn add<F>(&self, job: F)
    where
        F: FnOnce(Done) + Send + 'static,
    {
        self.state.lock().queue.push_back(Box::new(job));
        self.run();
    }

    /// Configured maximum number of running jobs
    pub fn concurrency(&self) -> usize {
        self.state.lock().concurrency
    }

    /// Number of jobs started but not yet done
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Number of jobs waiting for a slot
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Start queued jobs while slots are free
    ///
    /// A job that completes synchronously only releases its slot; the loop
    /// already on this thread's stack admits the next job, so a long backlog
    /// never nests.
    fn run(&self) {
        let Some(_guard) = DrainGuard::enter(Arc::as_ptr(&self.state) as usize) else {
            return;
        };
        loop {
            // The lock is released before the job runs so that a job may
            // complete synchronously.
            let job = {
                let mut state = self.state.lock();
                if state.pending >= state.concurrency {
                    return;
                }
                let Some(job) = state.queue.pop_front() else {
                    return;
                };
                state.pending += 1;
                trace!(pending = state.pending, queued = state.queue.len(), "job started");
                job
            };

            job(Done {
                limiter: Some(self.clone()),
            });
        }
    }

    fn finish(&self) {
        {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            trace!(pending = state.pending, "job finished");
        }
        self.run();
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Limiter")
            .field("concurrency", &state.concurrency)
            .field("pending", &state.pending)
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// Completion handle given to every job
///
/// Calling [`Done::done`] frees the job's slot and admits the next queued
/// job. Dropping the handle without calling it has the same effect, so a
/// panicking job cannot leak a slot.
pub struct Done {
    limiter: Option<Limiter>,
}

impl Done {
    /// Mark the job finished
    pub fn done(mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.finish();
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.finish();
        }
    }
}
