//! Shared worker pool with task-time tracking.

use super::SchedError;
use crossbeam::channel::{bounded, Receiver};
use hegemon_utils::{AtomicF64, CountGuard};
use log::*;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    running: AtomicBool,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    completed: AtomicU64,
    total_task_ms: AtomicF64,
}

/// Handle to a submitted task's eventual result.
///
/// Tasks are not cancellable; dropping the handle merely discards the result.
/// A panic inside the task is captured and surfaced here, never to the pool.
pub struct TaskHandle<T> {
    receiver: Receiver<Result<T, SchedError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes. A task dropped unexecuted by
    /// [`WorkerPool::shutdown`] resolves to [`SchedError::ShutdownInProgress`].
    pub fn join(self) -> Result<T, SchedError> {
        self.receiver
            .recv()
            .unwrap_or(Err(SchedError::ShutdownInProgress))
    }
}

/// Fixed set of long-lived worker threads consuming a FIFO task queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns a pool with `worker_count` threads (minimum 1).
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            running: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            total_task_ms: AtomicF64::new(0.0),
        });

        let workers = (0..worker_count)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("hegemon-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("couldn't spawn pool worker")
            })
            .collect();

        debug!("Worker pool started with {worker_count} workers");
        Self { shared, workers }
    }

    /// Enqueues `task` and returns a handle to its result.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>, SchedError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(SchedError::ShutdownInProgress);
        }

        let (sender, receiver) = bounded(1);
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!("Worker task panicked: {message}");
                SchedError::TaskFailed(message)
            });
            let _ = sender.send(outcome);
        });

        self.shared.queue.lock().push_back(job);
        self.shared.condvar.notify_one();
        Ok(TaskHandle { receiver })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Highest number of tasks ever observed running at once.
    pub fn peak_active_count(&self) -> usize {
        self.shared.peak_active.load(Ordering::Acquire)
    }

    /// Mean execution time across all completed tasks, in milliseconds.
    pub fn avg_task_ms(&self) -> f64 {
        let completed = self.shared.completed.load(Ordering::Acquire);
        if completed == 0 {
            return 0.0;
        }
        self.shared.total_task_ms.load(Ordering::Acquire) / completed as f64
    }

    /// Signals every worker to stop, lets in-flight tasks finish, joins all
    /// workers, and discards queued-but-unstarted tasks (their handles
    /// resolve to [`SchedError::ShutdownInProgress`]).
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.condvar.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.shared.queue.lock().clear();
        debug!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                shared.condvar.wait(&mut queue);
            }
        };

        let started = Instant::now();
        {
            // Guard keeps the active count correct on every exit path.
            let _guard = CountGuard::new(&shared.active);
            shared
                .peak_active
                .fetch_max(shared.active.load(Ordering::Acquire), Ordering::AcqRel);
            job();
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
        shared.total_task_ms.fetch_add(elapsed_ms, Ordering::AcqRel);
        shared.completed.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use crate::engine::SchedError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn tasks_resolve_through_their_handles() {
        let pool = WorkerPool::new(2);
        let handle = pool.submit(|| 2 + 2).unwrap();
        assert_eq!(handle.join().unwrap(), 4);
    }

    #[test]
    fn a_panicking_task_does_not_poison_the_pool() {
        let pool = WorkerPool::new(1);

        let bad = pool
            .submit(|| {
                panic!("deliberate");
            })
            .unwrap();
        match bad.join() {
            Err(SchedError::TaskFailed(message)) => assert!(message.contains("deliberate")),
            other => panic!("expected TaskFailed, got {other:?}"),
        }

        // The same worker must still serve further tasks.
        let good = pool.submit(|| 7).unwrap();
        assert_eq!(good.join().unwrap(), 7);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn statistics_reflect_completed_work() {
        let pool = WorkerPool::new(4);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                pool.submit(|| thread::sleep(Duration::from_millis(5)))
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.avg_task_ms() >= 5.0);
        assert!(pool.peak_active_count() >= 2);
        assert_eq!(pool.queued_count(), 0);
    }

    #[test]
    fn shutdown_joins_workers_and_clears_counts() {
        let mut pool = WorkerPool::new(3);
        let finished = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let finished = finished.clone();
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(2));
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }

        pool.shutdown();
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.queued_count(), 0);
        assert!(matches!(
            pool.submit(|| ()),
            Err(SchedError::ShutdownInProgress)
        ));
    }
}
