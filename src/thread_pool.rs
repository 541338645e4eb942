// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A pool of worker threads resuming suspended computations with FIFO
//! scheduling over one shared queue.

use crate::error::ScheduleError;
use crate::executor::{self, Executor, Reschedule};
use crate::task::{Task, TaskRef};
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::{Context, Poll};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Callback invoked with the worker's index when it starts or stops.
pub type WorkerCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Construction options for a [`ThreadPool`].
#[derive(Clone, Default)]
pub struct Options {
    /// Number of workers; defaults to the number of available CPUs.
    pub thread_count: Option<usize>,
    /// Invoked on the worker thread before it begins draining the queue.
    pub on_thread_start: Option<WorkerCallback>,
    /// Invoked on the worker thread after it has drained and exited.
    pub on_thread_stop: Option<WorkerCallback>,
}

/// N workers draining one mutex-protected FIFO deque of suspended handles.
///
/// Each worker dequeues in FIFO order; with multiple workers there is no
/// ordering guarantee between handles consumed by different workers.
/// Shutdown is graceful: already-enqueued work is drained before the
/// workers exit, and further scheduling fails with [`ScheduleError`].
pub struct ThreadPool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    queue: Mutex<VecDeque<TaskRef>>,
    available: Condvar,
    /// Logical in-flight items: scheduled + queued + currently resuming.
    size: AtomicUsize,
    shutdown_requested: AtomicBool,
    on_thread_start: Option<WorkerCallback>,
    on_thread_stop: Option<WorkerCallback>,
}

// === impl ThreadPool ===

impl ThreadPool {
    /// Spawn `opts.thread_count` workers (defaulting to the CPU count).
    pub fn new(opts: Options) -> Self {
        let thread_count = opts.thread_count.unwrap_or_else(num_cpus::get).max(1);

        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            size: AtomicUsize::new(0),
            shutdown_requested: AtomicBool::new(false),
            on_thread_start: opts.on_thread_start,
            on_thread_stop: opts.on_thread_stop,
        });

        let workers = (0..thread_count)
            .map(|idx| {
                let inner = inner.clone();
                std::thread::Builder::new()
                    .name(format!("exio-worker-{idx}"))
                    .spawn(move || Inner::worker(&inner, idx))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// An awaitable that re-schedules the awaiting computation onto the
    /// pool: awaiting it always suspends, and execution continues on a
    /// worker thread.
    ///
    /// # Errors
    ///
    /// Fails with [`ScheduleError`] once [`shutdown`](Self::shutdown) has
    /// been requested.
    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        if self.inner.shutdown_requested.load(Ordering::Relaxed) {
            return Err(ScheduleError(()));
        }
        Ok(Schedule {
            inner: Reschedule::onto(self.inner.clone()),
        })
    }

    /// Build a task that hops onto the pool and then invokes `f` there.
    ///
    /// # Errors
    ///
    /// Fails with [`ScheduleError`] once [`shutdown`](Self::shutdown) has
    /// been requested.
    pub fn schedule_fn<F, R>(&self, f: F) -> Result<Task<R>, ScheduleError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let schedule = self.schedule()?;
        Ok(Task::new(async move {
            schedule.await;
            f()
        }))
    }

    /// Re-schedule the awaiting computation, granting another ready handle
    /// a turn on the workers.
    ///
    /// # Errors
    ///
    /// Fails with [`ScheduleError`] once [`shutdown`](Self::shutdown) has
    /// been requested.
    pub fn yield_now(&self) -> Result<Schedule, ScheduleError> {
        self.schedule()
    }

    /// Enqueue a bare suspended handle for resumption on a worker.
    pub fn resume(&self, task: TaskRef) {
        self.inner.resume(task);
    }

    /// Logical in-flight items (scheduled + queued + running).
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Request stop, wake every worker, and join them. Already-enqueued
    /// handles are drained first. Idempotent.
    pub fn shutdown(&self) {
        let already_requested = {
            // holding the queue lock orders the flag against a worker's
            // atomic check-then-wait, so no worker can sleep through it
            let _queue = self.inner.queue.lock();
            self.inner.shutdown_requested.swap(true, Ordering::AcqRel)
        };

        if !already_requested {
            self.inner.available.notify_all();

            let workers = core::mem::take(&mut *self.workers.lock());
            for worker in workers {
                let _ = worker.join();
            }
        }
    }
}

impl Executor for ThreadPool {
    fn resume(&self, task: TaskRef) {
        self.inner.resume(task);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// === impl Inner ===

impl Inner {
    fn resume(&self, task: TaskRef) {
        self.size.fetch_add(1, Ordering::Release);
        self.queue.lock().push_back(task);
        self.available.notify_one();
    }

    fn worker(this: &Arc<Self>, idx: usize) {
        if let Some(on_start) = &this.on_thread_start {
            on_start(idx);
        }

        let _span = tracing::debug_span!("worker", worker = idx).entered();
        tracing::debug!(worker = idx, "worker started");

        loop {
            let mut queue = this.queue.lock();
            while queue.is_empty() && !this.shutdown_requested.load(Ordering::Acquire) {
                this.available.wait(&mut queue);
            }

            // drain everything currently visible before re-checking stop
            while let Some(task) = queue.pop_front() {
                drop(queue);

                tracing::trace!(worker = idx, task.tid = task.id().as_u64(), "resuming");
                executor::enter(|| task.resume());
                this.size.fetch_sub(1, Ordering::Release);

                queue = this.queue.lock();
            }
            drop(queue);

            if this.shutdown_requested.load(Ordering::Acquire) {
                break;
            }
        }

        tracing::debug!(worker = idx, "worker stopped");

        if let Some(on_stop) = &this.on_thread_stop {
            on_stop(idx);
        }
    }
}

impl Executor for Inner {
    fn resume(&self, task: TaskRef) {
        Inner::resume(self, task);
    }
}

/// Awaitable returned by [`ThreadPool::schedule`] and
/// [`ThreadPool::yield_now`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Schedule {
    inner: Reschedule,
}

impl Future for Schedule {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::sync_wait::sync_wait;
    use crate::sync::when_all::when_all;
    use crate::test_util::trace_init;

    #[test]
    fn work_runs_on_a_worker() {
        let _trace = trace_init();
        let pool = Arc::new(ThreadPool::new(Options {
            thread_count: Some(2),
            ..Options::default()
        }));

        let caller = std::thread::current().id();
        let p = pool.clone();
        let ran_on = sync_wait(Task::new(async move {
            p.schedule().unwrap().await;
            std::thread::current().id()
        }));

        assert_ne!(ran_on, caller);
        pool.shutdown();
    }

    #[test]
    fn schedule_fails_after_shutdown() {
        let pool = ThreadPool::new(Options {
            thread_count: Some(1),
            ..Options::default()
        });
        pool.shutdown();
        assert!(pool.schedule().is_err());
        assert!(pool.schedule_fn(|| 1).is_err());
    }

    #[test]
    fn shutdown_drains_enqueued_work() {
        let _trace = trace_init();
        let pool = Arc::new(ThreadPool::new(Options {
            thread_count: Some(1),
            ..Options::default()
        }));

        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let p = pool.clone();
                let counter = counter.clone();
                Task::new(async move {
                    p.schedule().unwrap().await;
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        sync_wait(when_all(tasks));
        pool.shutdown();

        assert_eq!(counter.load(Ordering::Relaxed), 64);
        assert!(pool.is_empty());
    }

    #[test]
    fn single_worker_runs_fifo() {
        let _trace = trace_init();
        let pool = Arc::new(ThreadPool::new(Options {
            thread_count: Some(1),
            ..Options::default()
        }));

        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let p = pool.clone();
                let order = order.clone();
                Task::new(async move {
                    p.schedule().unwrap().await;
                    order.lock().push(i);
                })
            })
            .collect();

        sync_wait(when_all(tasks));
        pool.shutdown();

        // one worker consumes the shared queue strictly in enqueue order
        assert_eq!(*order.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn worker_callbacks_see_real_indices() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(Mutex::new(Vec::new()));

        let on_start = {
            let started = started.clone();
            Arc::new(move |idx| started.lock().push(idx)) as WorkerCallback
        };
        let on_stop = {
            let stopped = stopped.clone();
            Arc::new(move |idx| stopped.lock().push(idx)) as WorkerCallback
        };

        let pool = ThreadPool::new(Options {
            thread_count: Some(3),
            on_thread_start: Some(on_start),
            on_thread_stop: Some(on_stop),
        });
        pool.shutdown();

        let mut started = started.lock().clone();
        started.sort_unstable();
        let mut stopped = stopped.lock().clone();
        stopped.sort_unstable();
        assert_eq!(started, vec![0usize, 1, 2]);
        assert_eq!(stopped, vec![0usize, 1, 2]);
    }

    #[test]
    fn schedule_fn_invokes_on_worker() {
        let pool = Arc::new(ThreadPool::new(Options {
            thread_count: Some(1),
            ..Options::default()
        }));

        let task = pool.schedule_fn(|| 7 * 6).unwrap();
        assert_eq!(sync_wait(task), 42);
        pool.shutdown();
    }
}
