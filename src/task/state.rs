// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use bitflags::bitflags;
use core::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: usize {
        /// The frame sits in some executor's queue (or the local trampoline)
        /// and will be polled.
        const SCHEDULED = 0b0001;
        /// The frame is being polled right now, on some thread.
        const RUNNING   = 0b0010;
        /// A wakeup arrived while the frame was RUNNING; the poller turns
        /// this into a reschedule when the poll ends.
        const NOTIFIED  = 0b0100;
        /// The frame ran to completion (value or captured failure stored).
        const COMPLETE  = 0b1000;
        /// The frame has been scheduled at least once. Never cleared;
        /// lets an awaiter distinguish "never started" from "suspended
        /// elsewhere, leave it alone".
        const STARTED   = 0b1_0000;
    }
}

/// Outcome of [`State::end_poll`] for a frame that returned pending.
///
/// Mirrors what the scheduler should do with the polled frame: nothing (a
/// waker is registered elsewhere), or put it straight back on its executor
/// because it woke itself mid-poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    Pending,
    PendingSchedule,
}

/// The atomic lifecycle word of a task frame.
///
/// The word encodes *empty/suspended* (no flags), *scheduled*, *running*,
/// and *done*; `NOTIFIED` records a wake that raced with a poll. All
/// transitions are single CAS loops with acquire/release pairing.
pub(crate) struct State(AtomicUsize);

impl State {
    pub(crate) fn new() -> Self {
        Self(AtomicUsize::new(Flags::empty().bits()))
    }

    /// Transition towards a poll: a waker (or the initial start) requests
    /// that the frame be enqueued.
    ///
    /// Returns `true` when the caller now owns the responsibility of
    /// handing the frame to its executor. Returns `false` when the frame
    /// is already queued, already complete, or running (in which case the
    /// wakeup is recorded in `NOTIFIED` and the poller reschedules).
    pub(crate) fn transition_to_scheduled(&self) -> bool {
        let mut current = self.load();
        loop {
            if current.contains(Flags::COMPLETE) || current.contains(Flags::SCHEDULED) {
                return false;
            }

            let next = if current.contains(Flags::RUNNING) {
                current | Flags::NOTIFIED | Flags::STARTED
            } else {
                current | Flags::SCHEDULED | Flags::STARTED
            };

            match self.compare_exchange(current, next) {
                Ok(_) => return !current.contains(Flags::RUNNING),
                Err(actual) => current = actual,
            }
        }
    }

    /// `SCHEDULED` -> `RUNNING`. Clears a pending `NOTIFIED` so that only
    /// wakes arriving *during* this poll are observed by [`end_poll`].
    ///
    /// Returns `false` if the frame must not be polled (already complete).
    pub(crate) fn start_poll(&self) -> bool {
        let mut current = self.load();
        loop {
            if current.contains(Flags::COMPLETE) || current.contains(Flags::RUNNING) {
                return false;
            }

            let next = (current - (Flags::SCHEDULED | Flags::NOTIFIED)) | Flags::RUNNING;
            match self.compare_exchange(current, next) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// `RUNNING` -> suspended, translating a mid-poll wake into
    /// [`PollResult::PendingSchedule`].
    pub(crate) fn end_poll(&self) -> PollResult {
        let mut current = self.load();
        loop {
            debug_assert!(current.contains(Flags::RUNNING));

            let (next, result) = if current.contains(Flags::NOTIFIED) {
                (
                    (current - (Flags::RUNNING | Flags::NOTIFIED)) | Flags::SCHEDULED,
                    PollResult::PendingSchedule,
                )
            } else {
                (current - Flags::RUNNING, PollResult::Pending)
            };

            match self.compare_exchange(current, next) {
                Ok(_) => return result,
                Err(actual) => current = actual,
            }
        }
    }

    /// `RUNNING` -> `COMPLETE`. The frame's output slot must be filled
    /// before calling this; the release store publishes it.
    pub(crate) fn complete(&self) {
        let mut current = self.load();
        loop {
            let next = (current - (Flags::RUNNING | Flags::NOTIFIED | Flags::SCHEDULED))
                | Flags::COMPLETE;
            match self.compare_exchange(current, next) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.load().contains(Flags::COMPLETE)
    }

    pub(crate) fn was_started(&self) -> bool {
        self.load().contains(Flags::STARTED)
    }

    #[inline]
    fn load(&self) -> Flags {
        Flags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    #[inline]
    fn compare_exchange(&self, current: Flags, new: Flags) -> Result<Flags, Flags> {
        self.0
            .compare_exchange_weak(
                current.bits(),
                new.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(Flags::from_bits_retain)
            .map_err(Flags::from_bits_retain)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.load()).finish()
    }
}
