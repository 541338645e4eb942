// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The executor capability seam and the per-thread resume trampoline.
//!
//! Resuming one suspended computation frequently makes another one
//! runnable on the same thread (a completing task waking its awaiter, an
//! event waking its stack of waiters). Resuming those directly would
//! recurse once per link; instead every thread that resumes handles does
//! so through a trampoline: the outermost resume point installs a local
//! run queue, and nested resume requests append to it. Chains of any
//! length therefore run in constant stack depth.

use crate::task::{Schedulable, TaskRef};
use core::cell::RefCell;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::VecDeque;
use std::sync::Arc;

/// The capability executors expose to the rest of the runtime: accept a
/// suspended handle and resume it (on a worker, on the reactor, inline).
///
/// Implemented by [`ThreadPool`](crate::ThreadPool) and
/// [`IoScheduler`](crate::IoScheduler).
pub trait Executor: Send + Sync + 'static {
    /// Hand a suspended handle to this executor for resumption.
    fn resume(&self, task: TaskRef);
}

thread_local! {
    /// The local run queue; `Some` while a trampoline is installed on this
    /// thread.
    static RUN_QUEUE: RefCell<Option<VecDeque<TaskRef>>> = const { RefCell::new(None) };

    /// The frame currently being polled on this thread, if any.
    static CURRENT: RefCell<Option<Arc<dyn Schedulable>>> = const { RefCell::new(None) };
}

/// Resume `task` on the current thread.
///
/// Inside a trampoline this enqueues; otherwise it installs one, resumes
/// `task`, and drains everything that became runnable along the way.
pub(crate) fn schedule_local(task: TaskRef) {
    let deferred = RUN_QUEUE.with(|q| {
        let mut slot = q.borrow_mut();
        match &mut *slot {
            Some(queue) => {
                queue.push_back(task.clone());
                true
            }
            None => false,
        }
    });

    if !deferred {
        enter(|| task.resume());
    }
}

/// Run `f` with a trampoline installed, then drain the run queue.
///
/// Nested calls are flattened: if a trampoline is already installed on
/// this thread, `f` simply runs and the outermost `enter` drains.
pub(crate) fn enter<R>(f: impl FnOnce() -> R) -> R {
    let installed = RUN_QUEUE.with(|q| {
        let mut slot = q.borrow_mut();
        if slot.is_none() {
            *slot = Some(VecDeque::new());
            true
        } else {
            false
        }
    });

    if !installed {
        return f();
    }

    let _guard = Uninstall;
    let result = f();

    loop {
        let next = RUN_QUEUE.with(|q| {
            q.borrow_mut()
                .as_mut()
                .expect("trampoline queue uninstalled mid-drain, this is a bug")
                .pop_front()
        });
        match next {
            Some(task) => task.resume(),
            None => break,
        }
    }

    result
}

/// Clears the thread-local queue even if the drain unwinds, so a poisoned
/// thread can install a fresh trampoline later.
struct Uninstall;

impl Drop for Uninstall {
    fn drop(&mut self) {
        RUN_QUEUE.with(|q| *q.borrow_mut() = None);
    }
}

/// Run `f` with `task` recorded as the frame executing on this thread.
pub(crate) fn with_current<R>(task: &Arc<dyn Schedulable>, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT.with(|c| c.borrow_mut().replace(task.clone()));
    let result = f();
    CURRENT.with(|c| *c.borrow_mut() = prev);
    result
}

/// The frame currently being polled on this thread, if the caller is
/// inside a task poll.
pub(crate) fn current_task() -> Option<Arc<dyn Schedulable>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Suspends the awaiting computation and re-schedules it onto `target`:
/// the current task is re-bound so that this wakeup (and all later ones)
/// deliver there.
///
/// When the awaiter is not a task frame (a manually polled future), its
/// waker is handed to the target instead, which resumes it from the
/// target's threads.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Reschedule {
    target: Arc<dyn Executor>,
    queued: bool,
}

// === impl Reschedule ===

impl Reschedule {
    pub(crate) fn onto(target: Arc<dyn Executor>) -> Self {
        Self {
            target,
            queued: false,
        }
    }
}

impl Future for Reschedule {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.queued {
            return Poll::Ready(());
        }
        self.queued = true;

        match current_task() {
            Some(current) => {
                current.bind(Some(self.target.clone()));
                // recorded as a mid-poll wake; the frame's resume loop
                // delivers it to the new binding once this poll returns
                cx.waker().wake_by_ref();
            }
            None => {
                self.target
                    .resume(TaskRef::from_waker(cx.waker().clone()));
            }
        }

        Poll::Pending
    }
}
