// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Running an awaitable to completion from an unmanaged (blocking) thread.

use crate::task::Task;
use core::task::Waker;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::task::Wake;

/// The mutex+condvar event the private task signals on completion.
struct SyncWaitEvent {
    set: Mutex<bool>,
    cv: Condvar,
}

// === impl SyncWaitEvent ===

impl SyncWaitEvent {
    fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.set.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cv.wait(&mut set);
        }
    }
}

impl Wake for SyncWaitEvent {
    fn wake(self: Arc<Self>) {
        self.set();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.set();
    }
}

/// Drive `awaitable` to completion, blocking the calling thread.
///
/// The awaitable is wrapped in a private task whose continuation signals a
/// mutex+condvar event; the task is started on the calling thread and runs
/// there until it suspends (typically by rescheduling itself onto a pool
/// or reactor, which is then responsible for resuming it). Once the body
/// completes — on whatever thread — the event releases the caller and the
/// value is returned. A failure captured from the body is re-raised here.
///
/// This is the only blocking-wait primitive in the crate; everything else
/// suspends cooperatively.
pub fn sync_wait<F>(awaitable: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let event = Arc::new(SyncWaitEvent::new());
    let task = Task::new(awaitable);

    task.set_continuation(&Waker::from(event.clone()));
    task.start();
    event.wait();

    task.take_output()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use crate::thread_pool::{self, ThreadPool};

    #[test]
    fn returns_the_body_value() {
        assert_eq!(sync_wait(async { 42 }), 42);
    }

    #[test]
    fn waits_for_foreign_thread_resumption() {
        let _trace = trace_init();
        let pool = Arc::new(ThreadPool::new(thread_pool::Options {
            thread_count: Some(1),
            ..thread_pool::Options::default()
        }));

        let p = pool.clone();
        let value = sync_wait(async move {
            p.schedule().unwrap().await;
            "resumed elsewhere"
        });

        assert_eq!(value, "resumed elsewhere");
        pool.shutdown();
    }

    #[test]
    fn reraises_stored_failure() {
        let result = std::panic::catch_unwind(|| {
            sync_wait(async {
                panic!("failure travels to the blocking caller");
            })
        });
        assert!(result.is_err());
    }
}
