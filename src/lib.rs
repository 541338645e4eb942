// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A stackless-coroutine runtime core.
//!
//! The crate provides the execution and coordination primitives for
//! composing suspendable computations:
//!
//! - [`Task`]: a move-only handle owning one suspended computation,
//!   awaitable with continuation passing.
//! - [`Generator`]: a lazily pull-iterated sequence of yielded values.
//! - [`Event`](sync::event::Event): a level-triggered single-slot
//!   synchronizer with a lock-free waiter stack.
//! - [`when_all`](sync::when_all): a countdown-latch join over concurrent
//!   computations.
//! - [`sync_wait`](sync::sync_wait): a blocking bridge that drives an
//!   awaitable to completion from an unmanaged thread.
//! - [`ThreadPool`](thread_pool::ThreadPool): N workers draining one
//!   shared FIFO queue.
//! - [`TaskContainer`](task_container::TaskContainer): an owner for
//!   detached computations with deferred reclamation.
//! - [`IoScheduler`](io::IoScheduler): a single-reactor multiplexer for
//!   timers, schedule wakeups, and fd readiness.

mod error;
pub mod executor;
pub mod generator;
pub mod io;
pub mod loom;
pub mod sync;
pub mod task;
pub mod task_container;
pub mod thread_pool;

pub use error::ScheduleError;
pub use executor::Executor;
pub use futures::future;
pub use generator::{Generator, Yielder, generator};
pub use io::{IoScheduler, PollOp, PollStatus};
pub use sync::event::{Event, ResumeOrderPolicy};
pub use sync::sync_wait::sync_wait;
pub use sync::when_all::{when_all, when_all_tuple};
pub use task::{Task, TaskRef};
pub use task_container::TaskContainer;
pub use thread_pool::ThreadPool;

#[cfg(test)]
mod test_util;
