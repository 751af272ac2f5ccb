//! Fixed-size worker pool.
//!
//! Every worker is a named OS thread pulling boxed jobs from one shared
//! multi-consumer queue, so whichever worker is idle first picks up the next
//! job and no more than `size` jobs ever run at once. The pool is an ordinary
//! value: construct it, clone the handle into whatever needs to submit work,
//! and shut it down when you are done.

use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::guard::{lock, run_guarded};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Work that can be handed to the pool without being boxed first, so a
/// rejected submission gives the caller its value back.
pub(crate) trait Runnable: Send + 'static {
    fn run(self);
}

struct FnJob<F>(F);

impl<F> Runnable for FnJob<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(self) {
        (self.0)()
    }
}

// =============================================================================
// Workers
// =============================================================================

struct Worker {
    name: String,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(name: String, receiver: Receiver<Job>) -> Result<Self, PoolError> {
        let thread_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(worker = %thread_name, "worker started");
                // Ends once every sender is gone and the queue is drained.
                for job in receiver.iter() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        warn!(
                            worker = %thread_name,
                            error = %TaskError::from_panic(payload),
                            "job panicked"
                        );
                    }
                }
                debug!(worker = %thread_name, "worker stopped");
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        Ok(Worker { name, thread })
    }
}

// =============================================================================
// Pool
// =============================================================================

struct Shared {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<Worker>>,
    worker_ids: Vec<ThreadId>,
    terminated: Mutex<bool>,
    terminated_cond: Condvar,
    size: usize,
}

impl Shared {
    fn shutdown(&self) {
        drop(lock(&self.sender).take());

        let workers = std::mem::take(&mut *lock(&self.workers));
        let current = thread::current().id();
        if workers.is_empty() {
            // Another caller owns the joins. A worker must not wait on them,
            // since they include its own thread.
            if !self.worker_ids.contains(&current) {
                self.wait_terminated();
            }
            return;
        }

        for worker in workers {
            // A worker cannot join itself; it exits on its own once its job returns.
            if worker.thread.thread().id() == current {
                continue;
            }
            if worker.thread.join().is_err() {
                warn!(worker = %worker.name, "worker thread terminated abnormally");
            }
        }

        *lock(&self.terminated) = true;
        self.terminated_cond.notify_all();
        info!(size = self.size, "worker pool shut down");
    }

    fn wait_terminated(&self) {
        let mut terminated = lock(&self.terminated);
        while !*terminated {
            terminated = self
                .terminated_cond
                .wait(terminated)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a fixed set of worker threads. Clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        Self::with_config(&PoolConfig {
            workers,
            ..PoolConfig::default()
        })
    }

    pub fn with_config(config: &PoolConfig) -> Result<Self, PoolError> {
        if config.workers == 0 {
            return Err(PoolError::InvalidSize);
        }

        let (sender, receiver) = channel::unbounded::<Job>();
        let workers = (1..=config.workers)
            .map(|id| {
                Worker::spawn(
                    format!("{}-{}", config.thread_name_prefix, id),
                    receiver.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let worker_ids = workers.iter().map(|w| w.thread.thread().id()).collect();

        info!(size = config.workers, "worker pool started");
        Ok(WorkerPool {
            shared: Arc::new(Shared {
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(workers),
                worker_ids,
                terminated: Mutex::new(false),
                terminated_cond: Condvar::new(),
                size: config.workers,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.shared.sender).is_none()
    }

    /// Queues a job, or hands it back untouched if the pool is closed.
    pub(crate) fn try_dispatch<R: Runnable>(&self, job: R) -> Result<(), R> {
        let guard = lock(&self.shared.sender);
        let Some(sender) = guard.as_ref() else {
            return Err(job);
        };
        if sender.send(Box::new(move || job.run())).is_err() {
            // Workers only disconnect after the sender is dropped.
            warn!("job queue disconnected; job dropped");
        }
        Ok(())
    }

    /// Fire-and-forget submission.
    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_dispatch(FnJob(job)).map_err(|_| {
            debug!("rejected job submitted after shutdown");
            PoolError::Closed
        })
    }

    /// Runs `task(input)` on a worker and returns a handle to its result.
    pub fn submit<I, O, F>(&self, task: F, input: I) -> Result<TaskHandle<O>, PoolError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: FnOnce(I) -> Result<O, TaskError> + Send + 'static,
    {
        let (sender, receiver) = channel::bounded(1);
        self.execute(move || {
            let result = run_guarded(move || task(input));
            // Nobody is waiting if the handle was dropped.
            let _ = sender.send(result);
        })?;
        Ok(TaskHandle { receiver })
    }

    /// Stops accepting work, lets queued and running jobs finish, then joins
    /// every worker. Concurrent and later callers block until those joins are
    /// done, except when called from a pool worker, which only closes the
    /// queue and joins the other workers if it is the first caller.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

/// Eventual result of a job passed to [`WorkerPool::submit`].
pub struct TaskHandle<T> {
    receiver: Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks the calling thread until the task reports.
    pub fn join(self) -> Result<T, TaskError> {
        self.receiver.recv().unwrap_or(Err(TaskError::Abandoned))
    }

    /// Like `join`, but gives the handle back if the task has not reported
    /// within `timeout`.
    pub fn join_timeout(self, timeout: Duration) -> Result<Result<T, TaskError>, Self> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(TaskError::Abandoned)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    fn double(x: i32) -> Result<i32, TaskError> {
        Ok(x * 2)
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(PoolError::InvalidSize)));
    }

    #[test]
    fn test_submit_returns_result() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.submit(double, 21).unwrap();
        assert_eq!(handle.join(), Ok(42));
        assert_eq!(pool.size(), 2);
        pool.shutdown();
    }

    #[test]
    fn test_workers_are_named_from_prefix() {
        let config = PoolConfig {
            workers: 1,
            thread_name_prefix: "stage-runner".to_string(),
        };
        let pool = WorkerPool::with_config(&config).unwrap();
        let handle = pool
            .submit(|()| Ok(thread::current().name().map(str::to_string)), ())
            .unwrap();
        assert_eq!(handle.join(), Ok(Some("stage-runner-1".to_string())));
    }

    #[test]
    fn test_failing_task_reports_error() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool
            .submit(|_: ()| Err::<(), _>(TaskError::execution("disk full")), ())
            .unwrap();
        assert_eq!(handle.join(), Err(TaskError::Execution("disk full".into())));
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool
            .submit(|_: ()| -> Result<(), TaskError> { panic!("stage exploded") }, ())
            .unwrap();
        assert_eq!(handle.join(), Err(TaskError::Panicked("stage exploded".into())));

        // The single worker survived and still takes work.
        assert_eq!(pool.submit(double, 5).unwrap().join(), Ok(10));
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(2).unwrap();
        pool.shutdown();

        assert!(pool.is_shutdown());
        assert!(matches!(pool.submit(double, 1), Err(PoolError::Closed)));
        assert_eq!(pool.execute(|| {}), Err(PoolError::Closed));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shutdown());
    }

    #[test]
    fn test_concurrent_shutdown_waits_for_in_flight_job() {
        let pool = WorkerPool::new(1).unwrap();
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (gate_tx, gate_rx) = channel::bounded::<()>(1);
        let finished = Arc::new(AtomicBool::new(false));

        let job_finished = Arc::clone(&finished);
        pool.execute(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().ok();
            thread::sleep(Duration::from_millis(20));
            job_finished.store(true, Ordering::SeqCst);
        })
        .unwrap();
        started_rx.recv().unwrap();

        let first = {
            let pool = pool.clone();
            thread::spawn(move || pool.shutdown())
        };
        while !pool.is_shutdown() {
            thread::sleep(Duration::from_millis(1));
        }

        let (returned_tx, returned_rx) = channel::bounded(1);
        let second = {
            let pool = pool.clone();
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                pool.shutdown();
                returned_tx.send(finished.load(Ordering::SeqCst)).unwrap();
            })
        };

        // Both callers are parked while the job is gated.
        assert!(returned_rx.recv_timeout(Duration::from_millis(50)).is_err());

        gate_tx.send(()).unwrap();
        assert!(returned_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        first.join().unwrap();
        second.join().unwrap();

        // Already terminated: returns without blocking.
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queued_work() {
        let pool = WorkerPool::new(2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let done = Arc::clone(&done);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_concurrency_never_exceeds_pool_size() {
        let pool = WorkerPool::new(3).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.submit(
                    move |n: usize| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(n)
                    },
                    i,
                )
                .unwrap()
            })
            .collect();

        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, (0..12).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_join_timeout_returns_handle_when_not_ready() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool
            .submit(
                |_: ()| {
                    thread::sleep(Duration::from_millis(200));
                    Ok("slow")
                },
                (),
            )
            .unwrap();

        let start = Instant::now();
        let handle = match handle.join_timeout(Duration::from_millis(10)) {
            Ok(_) => panic!("task should still be running"),
            Err(handle) => handle,
        };
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(handle.join(), Ok("slow"));
    }

    #[test]
    fn test_shutdown_from_worker_does_not_deadlock() {
        let pool = WorkerPool::new(2).unwrap();
        let (done_tx, done_rx) = channel::bounded(1);

        let inner = pool.clone();
        pool.execute(move || {
            inner.shutdown();
            done_tx.send(()).unwrap();
        })
        .unwrap();

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.is_shutdown());
        assert_eq!(pool.execute(|| {}), Err(PoolError::Closed));
    }

    #[test]
    fn test_dropping_last_handle_stops_workers() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2).unwrap();
            for _ in 0..4 {
                let done = Arc::clone(&done);
                pool.execute(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }
}
