// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An owner for detached computations that reclaims their storage after
//! completion.
//!
//! Submitted tasks are stored in a dense slot table and wrapped in a
//! cleanup task that (1) re-schedules execution onto the owning executor,
//! (2) runs the user task, discarding (but logging) any failure so a
//! detached computation can never crash the process, and (3) hands its
//! slot to a pending-delete list that the next maintenance pass splices
//! back into the free list.

use crate::executor::{Executor, Reschedule};
use crate::task::Task;
use core::sync::atomic::{AtomicUsize, Ordering};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Whether [`TaskContainer::start`] runs a garbage-collection pass before
/// storing the new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarbageCollect {
    Yes,
    No,
}

/// Construction options for a [`TaskContainer`].
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Initial number of slots.
    pub reserve_size: usize,
    /// Multiplier applied to the slot table when the free list runs out.
    pub growth_factor: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reserve_size: 8,
            growth_factor: 2.0,
        }
    }
}

/// Owns detached tasks until they have completed.
pub struct TaskContainer<E: Executor> {
    shared: Arc<Shared<E>>,
}

struct Shared<E> {
    executor: Arc<E>,
    growth_factor: f64,
    /// Logical number of live (submitted, not yet reclaimed) tasks.
    size: AtomicUsize,
    slots: Mutex<Slots>,
}

struct Slots {
    tasks: Vec<Option<Task<()>>>,
    free: VecDeque<usize>,
    to_delete: Vec<usize>,
}

// === impl TaskContainer ===

impl<E: Executor> TaskContainer<E> {
    pub fn new(executor: Arc<E>, opts: Options) -> Self {
        let reserve = opts.reserve_size.max(1);
        let mut tasks = Vec::new();
        tasks.resize_with(reserve, || None);

        Self {
            shared: Arc::new(Shared {
                executor,
                growth_factor: opts.growth_factor.max(1.1),
                size: AtomicUsize::new(0),
                slots: Mutex::new(Slots {
                    tasks,
                    free: (0..reserve).collect(),
                    to_delete: Vec::new(),
                }),
            }),
        }
    }

    /// Take ownership of `task` and start it on the owning executor.
    ///
    /// The slot table grows by the growth factor when no slot is free.
    pub fn start(&self, task: Task<()>, cleanup: GarbageCollect) {
        self.shared.size.fetch_add(1, Ordering::Relaxed);

        let mut slots = self.shared.slots.lock();

        if cleanup == GarbageCollect::Yes {
            Shared::<E>::collect_locked(&mut slots);
        }

        let index = match slots.free.pop_front() {
            Some(index) => index,
            None => Shared::<E>::grow(&mut slots, self.shared.growth_factor),
        };

        // store before starting; the lock is held, so the wrapper cannot
        // return its slot before it is occupied
        let wrapper = Task::new(Shared::cleanup_task(self.shared.clone(), task, index));
        wrapper.start();
        slots.tasks[index] = Some(wrapper);
    }

    /// Reclaim every completed slot. Returns the number reclaimed.
    pub fn garbage_collect(&self) -> usize {
        Shared::<E>::collect_locked(&mut self.shared.slots.lock())
    }

    /// Repeatedly collect and yield to the executor until every owned
    /// task has completed; used to drain before shutdown.
    ///
    /// The returned future owns its state, so it can itself be submitted
    /// to an executor outliving this borrow.
    pub fn garbage_collect_and_yield_until_empty(
        &self,
    ) -> impl Future<Output = ()> + Send + 'static {
        let shared = self.shared.clone();
        async move {
            loop {
                Shared::<E>::collect_locked(&mut shared.slots.lock());
                if shared.size.load(Ordering::Relaxed) == 0 {
                    // a wrapper queues its slot before decrementing size,
                    // so one last pass reclaims any straggler
                    Shared::<E>::collect_locked(&mut shared.slots.lock());
                    break;
                }
                Reschedule::onto(shared.executor.clone()).await;
            }
        }
    }

    /// Number of live (not yet reclaimed) tasks.
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Current slot-table capacity.
    pub fn capacity(&self) -> usize {
        self.shared.slots.lock().tasks.len()
    }
}

impl<E: Executor> Drop for TaskContainer<E> {
    fn drop(&mut self) {
        while !self.is_empty() {
            self.garbage_collect();
            std::thread::yield_now();
        }
        self.garbage_collect();
    }
}

// === impl Shared ===

impl<E: Executor> Shared<E> {
    /// The cleanup wrapper around each submitted task.
    async fn cleanup_task(shared: Arc<Self>, user_task: Task<()>, index: usize) {
        Reschedule::onto(shared.executor.clone()).await;

        if let Err(payload) = AssertUnwindSafe(user_task).catch_unwind().await {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .map(String::from)
                .or_else(|| payload.downcast_ref::<String>().cloned());
            tracing::error!(
                message = message.as_deref().unwrap_or("<non-string panic payload>"),
                "detached task had an unhandled failure",
            );
        }

        let mut slots = shared.slots.lock();
        slots.to_delete.push(index);
        shared.size.fetch_sub(1, Ordering::Relaxed);
    }

    fn collect_locked(slots: &mut Slots) -> usize {
        let deleted = slots.to_delete.len();
        while let Some(index) = slots.to_delete.pop() {
            slots.tasks[index] = None;
            slots.free.push_back(index);
        }
        deleted
    }

    /// Extend the slot table, handing the first fresh index to the caller
    /// and queuing the rest on the free list.
    fn grow(slots: &mut Slots, growth_factor: f64) -> usize {
        let old_size = slots.tasks.len();
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "growth factor is clamped above 1.0 and table sizes are small"
        )]
        let new_size = ((old_size as f64 * growth_factor) as usize).max(old_size + 1);

        slots.tasks.resize_with(new_size, || None);
        for index in (old_size + 1)..new_size {
            slots.free.push_back(index);
        }

        old_size
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::event::{Event, ResumeOrderPolicy};
    use crate::sync::sync_wait::sync_wait;
    use crate::test_util::trace_init;
    use crate::thread_pool::{self, ThreadPool};

    fn pool() -> Arc<ThreadPool> {
        Arc::new(ThreadPool::new(thread_pool::Options {
            thread_count: Some(2),
            ..thread_pool::Options::default()
        }))
    }

    #[test]
    fn detached_tasks_run_and_are_reclaimed() {
        let _trace = trace_init();
        let pool = pool();
        let container = TaskContainer::new(pool.clone(), Options::default());

        let event = Arc::new(Event::new(false));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let event = event.clone();
            let done = done.clone();
            container.start(
                Task::new(async move {
                    event.wait().await;
                    done.fetch_add(1, Ordering::Relaxed);
                }),
                GarbageCollect::Yes,
            );
        }
        assert_eq!(container.size(), 4);

        event.set(ResumeOrderPolicy::Lifo);
        sync_wait(container.garbage_collect_and_yield_until_empty());

        assert_eq!(done.load(Ordering::Relaxed), 4);
        assert!(container.is_empty());
        pool.shutdown();
    }

    #[test]
    fn slot_table_grows_on_demand() {
        let pool = pool();
        let container = TaskContainer::new(
            pool.clone(),
            Options {
                reserve_size: 2,
                growth_factor: 2.0,
            },
        );
        assert_eq!(container.capacity(), 2);

        let gate = Arc::new(Event::new(false));
        for _ in 0..5 {
            let gate = gate.clone();
            container.start(
                Task::new(async move { gate.wait().await }),
                GarbageCollect::No,
            );
        }

        assert!(container.capacity() >= 5);
        assert_eq!(container.size(), 5);

        gate.set(ResumeOrderPolicy::Lifo);
        sync_wait(container.garbage_collect_and_yield_until_empty());
        pool.shutdown();
    }

    #[test]
    fn failures_are_swallowed() {
        let _trace = trace_init();
        let pool = pool();
        let container = TaskContainer::new(pool.clone(), Options::default());

        container.start(
            Task::new(async {
                panic!("detached tasks never crash the process");
            }),
            GarbageCollect::Yes,
        );

        sync_wait(container.garbage_collect_and_yield_until_empty());

        assert!(container.is_empty());
        pool.shutdown();
    }
}
