// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lazy pull-sequences of yielded values.
//!
//! A generator's body is an async block that receives a [`Yielder`] and
//! may suspend *only* at its yield points. Each [`Iterator::next`] call
//! resumes the body until it either yields a value or completes. Bodies
//! may be finite or infinite; a generator is not restartable, and
//! dropping it destroys the suspended body wherever it stopped.

use core::cell::RefCell;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::task::noop_waker;
use std::rc::Rc;

/// Create a generator from a coroutine body.
///
/// The body does not run until the generator is first advanced.
///
/// ```
/// use exio::generator;
///
/// let naturals = generator(|y| async move {
///     let mut n = 0u64;
///     loop {
///         y.yield_value(n).await;
///         n += 1;
///     }
/// });
///
/// let first: Vec<_> = naturals.take(3).collect();
/// assert_eq!(first, vec![0, 1, 2]);
/// ```
pub fn generator<T, F, Fut>(body: F) -> Generator<T>
where
    F: FnOnce(Yielder<T>) -> Fut,
    Fut: Future<Output = ()> + 'static,
{
    let slot = Rc::new(RefCell::new(None));
    let yielder = Yielder { slot: slot.clone() };
    Generator {
        body: Some(Box::pin(body(yielder))),
        slot,
    }
}

/// A lazily-evaluated sequence of yielded values.
pub struct Generator<T> {
    /// The suspended producer; `None` once it has run to completion.
    body: Option<Pin<Box<dyn Future<Output = ()>>>>,
    /// Hand-off slot filled by [`Yielder::yield_value`].
    slot: Rc<RefCell<Option<T>>>,
}

// === impl Generator ===

impl<T> Iterator for Generator<T> {
    type Item = T;

    /// Resume the producer until it yields or completes.
    ///
    /// # Panics
    ///
    /// Panics if the body suspends on anything other than its own
    /// [`Yielder`] — generator bodies may not await foreign awaitables —
    /// and re-raises a panic escaping the body.
    fn next(&mut self) -> Option<T> {
        let body = self.body.as_mut()?;

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        match body.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.body = None;
                None
            }
            Poll::Pending => match self.slot.borrow_mut().take() {
                Some(value) => Some(value),
                None => panic!("generator body suspended without yielding a value"),
            },
        }
    }
}

/// The yield handle passed to a generator body.
pub struct Yielder<T> {
    slot: Rc<RefCell<Option<T>>>,
}

// === impl Yielder ===

impl<T> Yielder<T> {
    /// Produce `value` and suspend until the consumer pulls again.
    pub fn yield_value(&self, value: T) -> YieldValue<'_, T> {
        YieldValue {
            slot: &self.slot,
            value: Some(value),
        }
    }
}

/// Future returned by [`Yielder::yield_value`]: stores the value, then
/// suspends exactly once.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldValue<'a, T> {
    slot: &'a Rc<RefCell<Option<T>>>,
    value: Option<T>,
}

// No field of `YieldValue` is structurally pinned; the value is moved into
// the hand-off slot by value.
impl<T> Unpin for YieldValue<'_, T> {}

impl<T> Future for YieldValue<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.value.take() {
            Some(value) => {
                *this.slot.borrow_mut() = Some(value);
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn finite_sequence() {
        let seq = generator(|y| async move {
            for i in 0..3u32 {
                y.yield_value(i).await;
            }
        });
        assert_eq!(seq.collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn infinite_sequence_is_lazy() {
        let seq = generator(|y| async move {
            let mut n = 0u64;
            loop {
                y.yield_value(n).await;
                n += 1;
            }
        });

        let mut produced = Vec::new();
        for value in seq {
            if value > 100 {
                break;
            }
            produced.push(value);
        }

        // exactly 0..=100, and breaking dropped the suspended frame
        assert_eq!(produced.len(), 101);
        assert_eq!(produced.first(), Some(&0));
        assert_eq!(produced.last(), Some(&100));
    }

    #[test]
    fn drop_destroys_the_suspended_frame() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());

        let mut seq = generator(move |y| async move {
            let _guard = guard;
            loop {
                y.yield_value(1u8).await;
            }
        });

        assert_eq!(seq.next(), Some(1));
        assert!(!dropped.load(Ordering::Acquire));
        drop(seq);
        assert!(dropped.load(Ordering::Acquire));
    }

    #[test]
    fn body_panic_propagates_on_next() {
        let mut seq = generator(|y: Yielder<u8>| async move {
            y.yield_value(1).await;
            panic!("producer failed");
        });
        assert_eq!(seq.next(), Some(1));

        let result = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| seq.next()));
        assert!(result.is_err());
    }

    #[test]
    #[should_panic(expected = "suspended without yielding")]
    fn foreign_awaits_are_rejected() {
        let mut seq = generator(|y: Yielder<u8>| async move {
            futures::future::pending::<()>().await;
            y.yield_value(1).await;
        });
        let _ = seq.next();
    }
}
