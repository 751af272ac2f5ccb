//! Dependent task chains with a single fallback.
//!
//! A chain is built front to back and does nothing until
//! [`Chain::exceptionally`] attaches the fallback and launches it:
//!
//! ```no_run
//! use task_chain::{Chain, TaskError, WorkerPool};
//!
//! let pool = WorkerPool::new(4)?;
//! let handle = Chain::supply_async(&pool, || Ok("Data from Database".to_string()))
//!     .then_apply_async(|data| Ok(data.to_uppercase()))
//!     .then_apply(|data| Ok(format!("Final Result: {}", data)))
//!     .exceptionally(|_err: TaskError| "Error Result".to_string())?;
//! assert_eq!(handle.join(), "Final Result: DATA FROM DATABASE");
//! pool.shutdown();
//! # Ok::<(), task_chain::PoolError>(())
//! ```
//!
//! Async stages run on pool workers, inline stages run on whichever thread
//! finished the stage before them. The first failure skips every remaining
//! stage and goes straight to the fallback.

use crate::error::{PoolError, TaskError};
use crate::guard::{lock, run_guarded};
use crate::pool::{Runnable, WorkerPool};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

type Continuation<T> = Box<dyn FnOnce(Result<T, TaskError>) + Send + 'static>;
type Launch<T> = Box<dyn FnOnce(Continuation<T>) + Send + 'static>;
type StageFn<I, O> = Box<dyn FnOnce(I) -> Result<O, TaskError> + Send + 'static>;
type Fallback<T> = Box<dyn FnOnce(TaskError) -> T + Send + 'static>;

// =============================================================================
// Execution state
// =============================================================================

/// Where a launched chain is in its lifecycle. Steps are numbered from 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChainState {
    #[default]
    Pending,
    Running { step: usize },
    Succeeded,
    Failed { step: usize },
    FallbackRunning,
    FallbackDone,
}

impl ChainState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainState::Succeeded | ChainState::FallbackDone)
    }
}

#[derive(Default)]
struct Tracker {
    state: Mutex<ChainState>,
}

impl Tracker {
    fn set(&self, state: ChainState) {
        trace!(?state, "chain state changed");
        *lock(&self.state) = state;
    }

    fn get(&self) -> ChainState {
        *lock(&self.state)
    }
}

fn run_stage<I, O, F>(tracker: &Tracker, step: usize, task: F, input: I) -> Result<O, TaskError>
where
    F: FnOnce(I) -> Result<O, TaskError>,
{
    tracker.set(ChainState::Running { step });
    let current = thread::current();
    debug!(step, thread = current.name().unwrap_or("unnamed"), "stage started");
    let result = run_guarded(move || task(input));
    if let Err(err) = &result {
        debug!(step, error = %err, "stage failed");
        tracker.set(ChainState::Failed { step });
    }
    result
}

// =============================================================================
// Pool-scheduled stages
// =============================================================================

struct AsyncStage<I, O> {
    step: usize,
    input: I,
    task: StageFn<I, O>,
    tracker: Arc<Tracker>,
    next: Continuation<O>,
}

impl<I, O> AsyncStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn schedule(self, pool: &WorkerPool) {
        if let Err(stage) = pool.try_dispatch(self) {
            stage.reject();
        }
    }

    fn reject(self) {
        warn!(step = self.step, "pool closed before stage could be scheduled");
        self.tracker.set(ChainState::Failed { step: self.step });
        (self.next)(Err(TaskError::PoolClosed));
    }
}

impl<I, O> Runnable for AsyncStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn run(self) {
        let result = run_stage(&self.tracker, self.step, self.task, self.input);
        (self.next)(result);
    }
}

// =============================================================================
// Terminal completion
// =============================================================================

/// Reports the chain's final value exactly once. Dropping it unreported
/// runs the fallback with `TaskError::Abandoned`.
struct Completion<T> {
    sender: Sender<thread::Result<T>>,
    fallback: Option<Fallback<T>>,
    tracker: Arc<Tracker>,
}

impl<T> Completion<T> {
    fn complete(mut self, result: Result<T, TaskError>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<T, TaskError>) {
        // An absent fallback means the value has already been sent.
        let Some(fallback) = self.fallback.take() else {
            return;
        };

        let outcome = match result {
            Ok(value) => {
                self.tracker.set(ChainState::Succeeded);
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "chain failed, running fallback");
                self.tracker.set(ChainState::FallbackRunning);
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || fallback(err)));
                self.tracker.set(ChainState::FallbackDone);
                outcome
            }
        };

        // The handle may be gone already, in which case nobody wants the value.
        let _ = self.sender.send(outcome);
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.fallback.is_some() {
            self.finish(Err(TaskError::Abandoned));
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// A chain of dependent stages that has not been launched yet.
#[must_use = "a chain does nothing until `exceptionally` launches it"]
pub struct Chain<T> {
    pool: WorkerPool,
    tracker: Arc<Tracker>,
    steps: usize,
    launch: Launch<T>,
}

impl<T: Send + 'static> Chain<T> {
    /// Starts a chain whose first stage runs on `pool`.
    pub fn supply_async<F>(pool: &WorkerPool, task: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        let tracker = Arc::new(Tracker::default());
        let stage_pool = pool.clone();
        let stage_tracker = Arc::clone(&tracker);

        let launch: Launch<T> = Box::new(move |next| {
            AsyncStage {
                step: 1,
                input: (),
                task: Box::new(move |()| task()),
                tracker: stage_tracker,
                next,
            }
            .schedule(&stage_pool);
        });

        Chain {
            pool: pool.clone(),
            tracker,
            steps: 1,
            launch,
        }
    }

    /// Adds a stage that runs on the pool once the previous one succeeds.
    pub fn then_apply_async<U, F>(self, task: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U, TaskError> + Send + 'static,
    {
        let Chain {
            pool,
            tracker,
            steps,
            launch,
        } = self;
        let step = steps + 1;
        let stage_pool = pool.clone();
        let stage_tracker = Arc::clone(&tracker);

        let launch: Launch<U> = Box::new(move |next: Continuation<U>| {
            launch(Box::new(move |previous: Result<T, TaskError>| match previous {
                Ok(value) => AsyncStage {
                    step,
                    input: value,
                    task: Box::new(task),
                    tracker: stage_tracker,
                    next,
                }
                .schedule(&stage_pool),
                Err(err) => {
                    trace!(step, "stage skipped");
                    next(Err(err))
                }
            }));
        });

        Chain {
            pool,
            tracker,
            steps: step,
            launch,
        }
    }

    /// Adds a stage that runs inline on the thread that finished the
    /// previous stage.
    pub fn then_apply<U, F>(self, task: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U, TaskError> + Send + 'static,
    {
        let Chain {
            pool,
            tracker,
            steps,
            launch,
        } = self;
        let step = steps + 1;
        let stage_tracker = Arc::clone(&tracker);

        let launch: Launch<U> = Box::new(move |next: Continuation<U>| {
            launch(Box::new(move |previous: Result<T, TaskError>| match previous {
                Ok(value) => next(run_stage(&stage_tracker, step, task, value)),
                Err(err) => {
                    trace!(step, "stage skipped");
                    next(Err(err))
                }
            }));
        });

        Chain {
            pool,
            tracker,
            steps: step,
            launch,
        }
    }

    /// Attaches the fallback and launches the chain.
    ///
    /// Fails with [`PoolError::Closed`] if the pool was already shut down.
    /// Once launched, every failure (including a shutdown that races with a
    /// later stage) is handed to `fallback` instead.
    pub fn exceptionally<F>(self, fallback: F) -> Result<ChainHandle<T>, PoolError>
    where
        F: FnOnce(TaskError) -> T + Send + 'static,
    {
        if self.pool.is_shutdown() {
            return Err(PoolError::Closed);
        }

        let (sender, receiver) = channel::bounded(1);
        let completion = Completion {
            sender,
            fallback: Some(Box::new(fallback)),
            tracker: Arc::clone(&self.tracker),
        };

        debug!(stages = self.steps, "launching chain");
        (self.launch)(Box::new(move |result| completion.complete(result)));

        Ok(ChainHandle {
            receiver,
            tracker: self.tracker,
        })
    }
}

// =============================================================================
// Handle
// =============================================================================

/// The final value of a launched chain: either the last stage's output or
/// the fallback's.
pub struct ChainHandle<T> {
    receiver: Receiver<thread::Result<T>>,
    tracker: Arc<Tracker>,
}

impl<T> ChainHandle<T> {
    /// Blocks the calling thread until the chain reaches a terminal state.
    ///
    /// Stage failures never surface here. If the fallback itself panics, the
    /// panic is resumed on the joining thread.
    pub fn join(self) -> T {
        match self.receiver.recv() {
            Ok(outcome) => unwrap_outcome(outcome),
            Err(_) => unreachable!("chain completion reports before it is dropped"),
        }
    }

    /// Like `join`, but gives the handle back if the chain has not finished
    /// within `timeout`.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, Self> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Ok(unwrap_outcome(outcome)),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => {
                unreachable!("chain completion reports before it is dropped")
            }
        }
    }

    pub fn state(&self) -> ChainState {
        self.tracker.get()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }
}

fn unwrap_outcome<T>(outcome: thread::Result<T>) -> T {
    match outcome {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}
