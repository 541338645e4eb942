// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Joining N concurrent computations behind a single awaitable.
//!
//! Every input is wrapped in its own task; the wrappers share a countdown
//! latch initialized to N+1. Awaiting the join registers the awaiter as
//! the latch continuation, starts every wrapper, and takes the latch's own
//! decrement; each completing wrapper decrements once, and the 1 → 0
//! transition resumes the continuation exactly once. Failures do not
//! short-circuit: every wrapper runs to completion, holds its own captured
//! failure, and re-raises it only when the joined output is collected.

use crate::task::Task;
use atomic_waker::AtomicWaker;
use core::pin::Pin;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};
use std::sync::Arc;
use std::task::Wake;

/// The countdown: N wrapper completions plus the awaiter's own
/// [`try_await`](Latch::try_await) decrement.
struct Latch {
    count: AtomicUsize,
    continuation: AtomicWaker,
}

// === impl Latch ===

impl Latch {
    fn new(children: usize) -> Self {
        Self {
            count: AtomicUsize::new(children + 1),
            continuation: AtomicWaker::new(),
        }
    }

    /// The awaiter's decrement. Returns `true` when it should suspend
    /// (some wrapper is still running).
    fn try_await(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) > 1
    }

    /// A wrapper's decrement; the transition from 1 to 0 resumes the
    /// stored continuation.
    fn notify_completed(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.continuation.wake();
        }
    }

    fn is_ready(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }
}

/// The continuation each wrapper wakes when it finishes.
struct LatchNotify {
    latch: Arc<Latch>,
}

impl Wake for LatchNotify {
    fn wake(self: Arc<Self>) {
        self.latch.notify_completed();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.latch.notify_completed();
    }
}

/// Join a dynamic, homogeneous collection of awaitables.
///
/// The inputs do not start executing until the returned [`WhenAll`] is
/// first awaited. The output preserves input order: the i-th element is
/// the i-th input's result. A panic captured from one input is re-raised
/// when the output is collected — after every input has completed.
pub fn when_all<I, F, T>(awaitables: I) -> WhenAll<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let children: Vec<Task<T>> = awaitables.into_iter().map(Task::new).collect();
    WhenAll {
        latch: Arc::new(Latch::new(children.len())),
        children,
        started: false,
    }
}

/// Future returned by [`when_all`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WhenAll<T> {
    latch: Arc<Latch>,
    children: Vec<Task<T>>,
    started: bool,
}

// === impl WhenAll ===

impl<T: Send + 'static> WhenAll<T> {
    fn collect(&mut self) -> Vec<T> {
        self.children
            .drain(..)
            .map(|child| child.take_output())
            .collect()
    }
}

impl<T: Send + 'static> Future for WhenAll<T> {
    type Output = Vec<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if !this.started {
            this.started = true;
            this.latch.continuation.register(cx.waker());

            let notify = Arc::new(LatchNotify {
                latch: this.latch.clone(),
            });
            for child in &this.children {
                child.set_continuation(&Waker::from(notify.clone()));
                child.start();
            }

            if this.latch.try_await() {
                return Poll::Pending;
            }
            return Poll::Ready(this.collect());
        }

        this.latch.continuation.register(cx.waker());
        if this.latch.is_ready() {
            return Poll::Ready(this.collect());
        }
        Poll::Pending
    }
}

/// Join a fixed-arity, heterogeneous tuple of awaitables.
///
/// Same latch protocol as [`when_all`]; the output is the tuple of
/// results.
pub fn when_all_tuple<T: IntoTaskTuple>(awaitables: T) -> WhenAllTuple<T::Tasks> {
    let children = awaitables.into_tasks();
    WhenAllTuple {
        latch: Arc::new(Latch::new(children.len())),
        children: Some(children),
        started: false,
    }
}

/// Future returned by [`when_all_tuple`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WhenAllTuple<W: TaskTuple> {
    latch: Arc<Latch>,
    children: Option<W>,
    started: bool,
}

impl<W: TaskTuple> Future for WhenAllTuple<W> {
    type Output = W::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let children = this
            .children
            .as_ref()
            .expect("when_all_tuple polled after completion");

        if !this.started {
            this.started = true;
            this.latch.continuation.register(cx.waker());

            let notify = Arc::new(LatchNotify {
                latch: this.latch.clone(),
            });
            children.attach(&Waker::from(notify));

            if this.latch.try_await() {
                return Poll::Pending;
            }
            let children = this.children.take().expect("children present");
            return Poll::Ready(children.collect());
        }

        this.latch.continuation.register(cx.waker());
        if this.latch.is_ready() {
            let children = this.children.take().expect("children present");
            return Poll::Ready(children.collect());
        }
        Poll::Pending
    }
}

/// A tuple of wrapper tasks that a [`WhenAllTuple`] can start and drain.
pub trait TaskTuple: Send + Unpin {
    type Output;

    fn len(&self) -> usize;

    /// Register `waker` as each wrapper's continuation and start it.
    fn attach(&self, waker: &Waker);

    /// Take every wrapper's output, re-raising held failures.
    fn collect(self) -> Self::Output;
}

/// Conversion from a tuple of awaitables into a tuple of wrapper tasks.
pub trait IntoTaskTuple {
    type Tasks: TaskTuple;

    fn into_tasks(self) -> Self::Tasks;
}

macro_rules! impl_task_tuple {
    ($len:literal => $($F:ident / $idx:tt),+) => {
        impl<$($F),+> IntoTaskTuple for ($($F,)+)
        where
            $($F: Future + Send + 'static, $F::Output: Send + 'static,)+
        {
            type Tasks = ($(Task<$F::Output>,)+);

            fn into_tasks(self) -> Self::Tasks {
                ($(Task::new(self.$idx),)+)
            }
        }

        impl<$($F),+> TaskTuple for ($(Task<$F>,)+)
        where
            $($F: Send + 'static,)+
        {
            type Output = ($($F,)+);

            fn len(&self) -> usize {
                $len
            }

            fn attach(&self, waker: &Waker) {
                $(
                    self.$idx.set_continuation(waker);
                    self.$idx.start();
                )+
            }

            fn collect(self) -> Self::Output {
                ($(self.$idx.take_output(),)+)
            }
        }
    };
}

impl_task_tuple!(1 => A / 0);
impl_task_tuple!(2 => A / 0, B / 1);
impl_task_tuple!(3 => A / 0, B / 1, C / 2);
impl_task_tuple!(4 => A / 0, B / 1, C / 2, D / 3);
impl_task_tuple!(5 => A / 0, B / 1, C / 2, D / 3, E / 4);
impl_task_tuple!(6 => A / 0, B / 1, C / 2, D / 3, E / 4, G / 5);

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::sync_wait::sync_wait;
    use crate::test_util::trace_init;
    use crate::thread_pool::{self, ThreadPool};

    #[test]
    fn aggregates_in_input_order() {
        let children: Vec<_> = (0..10u64)
            .map(|i| Task::new(async move { (1..=i).sum::<u64>() }))
            .collect();

        let results = sync_wait(when_all(children));
        assert_eq!(results.len(), 10);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(*result, (1..=i as u64).sum::<u64>());
        }
    }

    #[test]
    fn joined_sum_matches_expected_total() {
        let _trace = trace_init();
        let pool = Arc::new(ThreadPool::new(thread_pool::Options {
            thread_count: Some(4),
            ..thread_pool::Options::default()
        }));

        let children: Vec<_> = (1..=10u64)
            .map(|i| {
                let p = pool.clone();
                async move {
                    p.schedule().unwrap().await;
                    i * 10
                }
            })
            .collect();

        let total: u64 = sync_wait(when_all(children)).into_iter().sum();
        assert_eq!(total, 550);
        pool.shutdown();
    }

    #[test]
    fn empty_join_completes_immediately() {
        let results = sync_wait(when_all(Vec::<Task<u32>>::new()));
        assert!(results.is_empty());
    }

    #[test]
    fn heterogeneous_tuple_join() {
        let joined = when_all_tuple((
            async { 1u32 },
            async { "two" },
            async { 3.0f64 },
        ));
        let (a, b, c) = sync_wait(joined);
        assert_eq!(a, 1);
        assert_eq!(b, "two");
        assert!((c - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn child_failure_does_not_short_circuit_siblings() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        let completed = Arc::new(AtomicUsize::new(0));
        let ok = {
            let completed = completed.clone();
            async move {
                completed.fetch_add(1, Ordering::Relaxed);
            }
        };
        let failing = async {
            panic!("child failed");
        };

        let joined = when_all(vec![Task::new(ok), Task::new(failing)]);
        let result = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| sync_wait(joined)));

        assert!(result.is_err());
        // the sibling ran to completion before the failure was re-raised
        assert_eq!(completed.load(Ordering::Relaxed), 1);
    }
}
