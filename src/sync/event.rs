// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A level-triggered single-slot synchronizer with a lock-free intrusive
//! waiter stack.

use crate::executor::Executor;
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use crate::task::TaskRef;
use atomic_waker::AtomicWaker;
use core::cell::UnsafeCell;
use core::fmt;
use core::pin::Pin;
use core::ptr;
use core::task::{Context, Poll};
use std::sync::Arc;

/// Order in which [`Event::set`] resumes the claimed waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeOrderPolicy {
    /// Resume in stack order: newest waiter first.
    #[default]
    Lifo,
    /// Reverse the claimed stack first, resuming in arrival order.
    Fifo,
}

/// Sentinel address for the "set" state.
///
/// A single static gives every `Event` one stable word that can never
/// collide with a heap-allocated waiter node, and keeps the state word
/// meaningful when the `Event` value itself is moved.
static SET: u8 = 0;

#[inline]
fn set_sentinel() -> *mut () {
    ptr::addr_of!(SET).cast_mut().cast()
}

/// A level-triggered event.
///
/// The entire state is one machine word:
///
/// - null: not set, no waiters;
/// - pointer to the head of a singly-linked LIFO stack of waiter nodes:
///   not set, with waiters;
/// - the `SET` sentinel: set.
///
/// Waiters push themselves with a CAS loop; [`set`](Self::set) claims the
/// whole stack with a single `swap(AcqRel)` and resumes every claimed
/// waiter, so a waiter that observes "set" mid-push completes without ever
/// appearing in the stack and none are stranded.
pub struct Event {
    state: AtomicPtr<()>,
}

/// One stack node. The stack holds a reference count on each pushed node
/// (dropped by whichever `set`/`drop` claims it), and the waiting future
/// holds its own, so an abandoned waiter can never dangle.
struct Waiter {
    /// Next node towards the stack's tail. Written by the pushing thread
    /// before publication, rewritten only by the claimer (which holds the
    /// whole list exclusively after the swap).
    next: UnsafeCell<*const Waiter>,
    waker: AtomicWaker,
    notified: AtomicBool,
}

// Safety: `next` is only touched by the publishing thread before the
// release-CAS and by the single claimer after the acquire-swap.
unsafe impl Send for Waiter {}
// Safety: see above.
unsafe impl Sync for Waiter {}

// === impl Event ===

impl Event {
    /// Create the event, optionally already in the set state.
    pub fn new(initially_set: bool) -> Self {
        let state = if initially_set {
            set_sentinel()
        } else {
            ptr::null_mut()
        };
        Self {
            state: AtomicPtr::new(state),
        }
    }

    /// Observe whether the event is set.
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == set_sentinel()
    }

    /// Wait until the event is set. Completes immediately (without
    /// suspending) when it already is.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            event: self,
            node: None,
        }
    }

    /// Set the event and resume every waiter inline, on the calling
    /// thread, in `policy` order.
    ///
    /// Setting an already-set event does nothing.
    pub fn set(&self, policy: ResumeOrderPolicy) {
        for node in self.claim(policy) {
            tracing::trace!(event = ?core::ptr::from_ref(self), "resuming waiter");
            node.notified.store(true, Ordering::Release);
            node.waker.wake();
        }
    }

    /// Set the event, handing each waiter's handle to `executor` for
    /// resumption instead of resuming inline.
    pub fn set_on<E: Executor>(&self, executor: &E, policy: ResumeOrderPolicy) {
        for node in self.claim(policy) {
            node.notified.store(true, Ordering::Release);
            if let Some(waker) = node.waker.take() {
                executor.resume(TaskRef::from_waker(waker));
            }
        }
    }

    /// Clear a set event. A no-op if the event is not set — in particular
    /// a state holding waiters is never observed as un-set.
    pub fn reset(&self) {
        let _ = self.state.compare_exchange(
            set_sentinel(),
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Swap in the sentinel and take ownership of the waiter stack, in
    /// resume order.
    fn claim(&self, policy: ResumeOrderPolicy) -> ClaimedWaiters {
        let old = self.state.swap(set_sentinel(), Ordering::AcqRel);
        if old == set_sentinel() {
            return ClaimedWaiters { head: ptr::null() };
        }

        let mut head = old.cast_const().cast::<Waiter>();
        if policy == ResumeOrderPolicy::Fifo {
            head = Self::reverse(head);
        }

        ClaimedWaiters { head }
    }

    /// Reverse the claimed (exclusively owned) stack in place.
    fn reverse(mut current: *const Waiter) -> *const Waiter {
        let mut prev: *const Waiter = ptr::null();

        while !current.is_null() {
            // Safety: the claimer exclusively owns the whole list.
            unsafe {
                let next = *(*current).next.get();
                *(*current).next.get() = prev;
                prev = current;
                current = next;
            }
        }

        prev
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("is_set", &self.is_set())
            .finish()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // reclaim the stack's references; live `Wait` futures borrow the
        // event, so no waiter can still be registered here
        drop(self.claim(ResumeOrderPolicy::Lifo));
    }
}

/// Iterator over a claimed waiter stack; owns one reference per node and
/// releases it after yielding, *after* having read the next link.
struct ClaimedWaiters {
    head: *const Waiter,
}

impl Iterator for ClaimedWaiters {
    type Item = Arc<Waiter>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.head.is_null() {
            return None;
        }

        // Safety: every non-sentinel pointer in the stack came from
        // `Arc::into_raw` in `Wait::poll`, and the claimer owns that
        // reference exclusively.
        let node = unsafe { Arc::from_raw(self.head) };
        // Safety: exclusive ownership of the claimed list.
        self.head = unsafe { *node.next.get() };
        Some(node)
    }
}

impl Drop for ClaimedWaiters {
    fn drop(&mut self) {
        for _ in self {}
    }
}

/// Future returned by [`Event::wait`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    event: &'a Event,
    /// The pushed stack node, once this future has registered itself.
    node: Option<Arc<Waiter>>,
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(node) = &self.node {
            // already in the stack, refresh the waker and re-check
            node.waker.register(cx.waker());
            if node.notified.load(Ordering::Acquire) {
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        let set = set_sentinel();
        let mut old = self.event.state.load(Ordering::Acquire);
        if old == set {
            return Poll::Ready(());
        }

        let node = Arc::new(Waiter {
            next: UnsafeCell::new(ptr::null()),
            waker: AtomicWaker::new(),
            notified: AtomicBool::new(false),
        });
        node.waker.register(cx.waker());
        let raw = Arc::into_raw(node.clone());

        loop {
            if old == set {
                // set() won while we were pushing: reclaim the stack's
                // reference and complete without ever suspending
                // Safety: `raw` was never published.
                drop(unsafe { Arc::from_raw(raw) });
                return Poll::Ready(());
            }

            // Safety: the node is unpublished, we are its only writer.
            unsafe {
                *node.next.get() = old.cast_const().cast();
            }

            match self.event.state.compare_exchange_weak(
                old,
                raw.cast_mut().cast(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.node = Some(node);
                    return Poll::Pending;
                }
                Err(actual) => old = actual,
            }
        }
    }
}
