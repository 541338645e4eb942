// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod id;
mod state;

use crate::executor::{self, Executor};
use atomic_waker::AtomicWaker;
use core::cell::UnsafeCell;
use core::fmt;
use core::mem;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use parking_lot::Mutex;
use std::panic;
use std::sync::Arc;
use std::task::Wake;

pub use id::Id;
pub(crate) use state::PollResult;
use state::State;

/// A unit of work an executor can queue and run.
///
/// Implemented by task frames and by bare-waker adapters; executors only
/// ever see this trait through [`TaskRef`].
pub(crate) trait Schedulable: Send + Sync {
    /// Run one resume cycle of this handle on the current thread.
    fn resume(self: Arc<Self>);

    /// Point the handle at a new executor. Later wakeups (and a wake that
    /// arrives during the current poll) deliver the handle there. `None`
    /// restores inline delivery on the waking thread.
    fn bind(&self, target: Option<Arc<dyn Executor>>);

    fn id(&self) -> Id;
}

/// A type-erased, reference-counted handle to one suspended computation.
///
/// `TaskRef`s are what executors queue: the thread pool's FIFO deque, the
/// reactor's inline-schedule list, and [`Event`](crate::Event) dispatch all
/// move `TaskRef`s, never concrete futures. The underlying frame is freed
/// when the last `TaskRef` pointing to it is dropped.
#[derive(Clone)]
pub struct TaskRef(Arc<dyn Schedulable>);
static_assertions::assert_impl_all!(TaskRef: Send, Sync);

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new(inner: Arc<dyn Schedulable>) -> Self {
        Self(inner)
    }

    /// Adapt a bare [`Waker`] into a schedulable handle.
    ///
    /// Resuming the handle invokes the waker exactly once; this is how an
    /// executor resumes an awaiter it only knows by its waker (for example
    /// [`Event::set_on`](crate::Event::set_on)).
    pub fn from_waker(waker: Waker) -> Self {
        Self(Arc::new(WakerTask {
            id: Id::next(),
            waker: Mutex::new(Some(waker)),
        }))
    }

    pub(crate) fn resume(self) {
        self.0.resume();
    }

    pub fn id(&self) -> Id {
        self.0.id()
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef").field("id", &self.id()).finish()
    }
}

/// Wraps a plain [`Waker`] so executors can treat it like any other
/// suspended handle.
struct WakerTask {
    id: Id,
    waker: Mutex<Option<Waker>>,
}

impl Schedulable for WakerTask {
    fn resume(self: Arc<Self>) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }

    fn bind(&self, _target: Option<Arc<dyn Executor>>) {}

    fn id(&self) -> Id {
        self.id
    }
}

/// The current lifecycle stage of a frame: the future itself, its output,
/// or nothing once the output has been taken.
enum Stage<T> {
    Pending(Pin<Box<dyn Future<Output = T> + Send>>),
    Ready(std::thread::Result<T>),
    Consumed,
}

// === impl Stage ===

impl<T> Stage<T> {
    /// Poll the future. A panic escaping the body is captured into the
    /// output slot and re-raised when the output is accessed.
    fn poll(&mut self, cx: &mut Context<'_>) -> bool {
        let Stage::Pending(future) = self else {
            unreachable!("task frame polled in a non-pending stage")
        };

        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))) {
            Ok(Poll::Pending) => false,
            Ok(Poll::Ready(value)) => {
                *self = Stage::Ready(Ok(value));
                true
            }
            Err(payload) => {
                *self = Stage::Ready(Err(payload));
                true
            }
        }
    }

    fn take_output(&mut self) -> T {
        match mem::replace(self, Stage::Consumed) {
            Stage::Ready(Ok(value)) => value,
            Stage::Ready(Err(payload)) => panic::resume_unwind(payload),
            Stage::Pending(_) => panic!("task output accessed before completion"),
            Stage::Consumed => panic!("task output taken twice"),
        }
    }
}

/// The heap-allocated frame behind a [`Task`].
///
/// Access to `stage` is serialized by the `RUNNING` bit of `state`: only
/// the thread that won [`State::start_poll`] may touch it, and after
/// `COMPLETE` only the (single) owner of the [`Task`] handle reads it.
pub(crate) struct RawTask<T> {
    id: Id,
    span: tracing::Span,
    state: State,
    stage: UnsafeCell<Stage<T>>,
    /// Consumer waiting on completion of this frame. Woken exactly once,
    /// when the frame transitions to `COMPLETE`.
    continuation: AtomicWaker,
    /// The executor wakeups deliver to; `None` means the waking thread's
    /// trampoline.
    binding: Mutex<Option<Arc<dyn Executor>>>,
}

// Safety: `stage` is guarded by the state machine described on the struct;
// everything else is atomics or locks.
unsafe impl<T: Send> Send for RawTask<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for RawTask<T> {}

// === impl RawTask ===

impl<T: Send + 'static> RawTask<T> {
    fn new<F>(future: F) -> Arc<Self>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let id = Id::next();
        let span = tracing::trace_span!("task", task.tid = id.as_u64());
        Arc::new(Self {
            id,
            span,
            state: State::new(),
            stage: UnsafeCell::new(Stage::Pending(Box::pin(future))),
            continuation: AtomicWaker::new(),
            binding: Mutex::new(None),
        })
    }

    /// Request that the frame be polled. No-op if it is already queued,
    /// running (the wake is recorded instead), or complete.
    fn wake_task(self: Arc<Self>) {
        if self.state.transition_to_scheduled() {
            self.deliver();
        }
    }

    /// Hand the (already `SCHEDULED`) frame to its bound executor, or to
    /// the current thread's trampoline when unbound.
    fn deliver(self: Arc<Self>) {
        let target = self.binding.lock().clone();
        let task = TaskRef::new(self);
        match target {
            Some(target) => target.resume(task),
            None => executor::schedule_local(task),
        }
    }
}

impl<T: Send + 'static> Schedulable for RawTask<T> {
    fn resume(self: Arc<Self>) {
        if !self.state.start_poll() {
            tracing::trace!(task.tid = self.id.as_u64(), "skipping poll");
            return;
        }

        let _enter = self.span.clone().entered();

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        let this: Arc<dyn Schedulable> = self.clone();
        let completed = executor::with_current(&this, || {
            // Safety: winning `start_poll` grants exclusive access to the
            // stage until the matching `end_poll`/`complete`.
            unsafe { (*self.stage.get()).poll(&mut cx) }
        });

        if completed {
            tracing::trace!(task.tid = self.id.as_u64(), "task complete");
            self.state.complete();
            self.continuation.wake();
            return;
        }

        if self.state.end_poll() == PollResult::PendingSchedule {
            // woken mid-poll, put the frame straight back on its executor
            self.deliver();
        }
    }

    fn bind(&self, target: Option<Arc<dyn Executor>>) {
        *self.binding.lock() = target;
    }

    fn id(&self) -> Id {
        self.id
    }
}

impl<T: Send + 'static> Wake for RawTask<T> {
    fn wake(self: Arc<Self>) {
        self.wake_task();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().wake_task();
    }
}

/// A move-only handle to one suspended computation.
///
/// Construction never runs any of the body: the frame is suspended at
/// entry until it is first awaited (or started by a combinator).
/// Awaiting a `Task` registers the awaiter as the frame's
/// continuation and resumes the frame on the current thread; when the body
/// completes, the continuation is woken exactly once and the output (or a
/// captured panic, re-raised) is handed to the awaiter.
///
/// Dropping a `Task` gives up the owner's reference; the frame itself is
/// destroyed once no executor queue holds it either.
#[must_use = "tasks do nothing unless `.await`ed or started"]
pub struct Task<T> {
    raw: Arc<RawTask<T>>,
}

// === impl Task ===

impl<T: Send + 'static> Task<T> {
    /// Create a task from a coroutine body. The body does not run until
    /// the task is awaited or started.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            raw: RawTask::new(future),
        }
    }

    /// `true` once the body has run to completion (value or failure
    /// stored).
    pub fn is_ready(&self) -> bool {
        self.raw.state.is_complete()
    }

    pub fn id(&self) -> Id {
        self.raw.id
    }

    /// Register `waker` to be woken when the body completes.
    pub(crate) fn set_continuation(&self, waker: &Waker) {
        self.raw.continuation.register(waker);
    }

    /// Begin (or re-request) execution of the frame without awaiting it.
    pub(crate) fn start(&self) {
        self.raw.clone().wake_task();
    }

    /// Take the stored output, re-raising a captured failure.
    ///
    /// Caller must have observed [`is_ready`](Self::is_ready); the single
    /// `Task` owner is the only reader of a completed stage.
    pub(crate) fn take_output(&self) -> T {
        debug_assert!(self.raw.state.is_complete());
        // Safety: `COMPLETE` is set (published with release ordering by the
        // polling thread), and `self` is the unique owner handle.
        unsafe { (*self.raw.stage.get()).take_output() }
    }
}

impl<T: Send + 'static> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.raw.state.is_complete() {
            return Poll::Ready(self.take_output());
        }

        self.set_continuation(cx.waker());

        // re-check: completion may have raced the registration above
        if self.raw.state.is_complete() {
            return Poll::Ready(self.take_output());
        }

        // first demand starts the frame; a frame that is already started
        // and suspended elsewhere is left to its registered wakeup
        if !self.raw.state.was_started() {
            self.start();
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.raw.id)
            .field("state", &self.raw.state)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::sync_wait::sync_wait;

    async fn square(x: u64) -> u64 {
        x * x
    }

    async fn square_and_add_5(x: u64) -> u64 {
        Task::new(square(x)).await + 5
    }

    #[test]
    fn value_round_trip() {
        assert_eq!(sync_wait(square(5)), 25);
    }

    #[test]
    fn nested_tasks() {
        assert_eq!(sync_wait(Task::new(square_and_add_5(5))), 30);
    }

    #[test]
    fn construction_is_lazy() {
        let task = Task::new(async {
            panic!("the body must not run unless awaited");
        });
        assert!(!task.is_ready());
        drop(task);
    }

    #[test]
    fn failure_is_reraised_on_result_access() {
        let result = std::panic::catch_unwind(|| {
            sync_wait(Task::new(async {
                panic!("boom");
            }))
        });
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn deep_await_chain_runs_in_bounded_stack() {
        // each link awaits the next through a full frame, so the chain only
        // completes if resumption is trampolined rather than recursive
        let mut task = Task::new(async { 0u64 });
        for _ in 0..100_000 {
            let inner = task;
            task = Task::new(async move { inner.await + 1 });
        }
        assert_eq!(sync_wait(task), 100_000);
    }
}
