// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use atomic_waker::AtomicWaker;
use core::sync::atomic::{AtomicU32, Ordering};
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// The readiness interest of a [`poll`](crate::IoScheduler::poll) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOp {
    Read,
    Write,
    ReadWrite,
}

impl PollOp {
    pub(crate) fn events(self) -> u32 {
        #[allow(clippy::cast_sign_loss, reason = "epoll event bits are a bitmask")]
        match self {
            PollOp::Read => libc::EPOLLIN as u32,
            PollOp::Write => libc::EPOLLOUT as u32,
            PollOp::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// The fd became ready for the requested operation.
    Event,
    /// The deadline passed before the fd became ready.
    Timeout,
    /// The fd reported an error condition (or registration failed).
    Error,
    /// The peer closed the fd.
    Closed,
}

/// Key into the pending-timer multimap: deadline, tie-broken by a stable
/// insertion sequence number.
pub(crate) type TimerKey = (Instant, u64);

const RESULT_PENDING: u32 = 0;

/// Per-wait record shared between the waiting future and the reactor.
///
/// `result` is the one-shot completion word: zero while pending, the
/// encoded [`PollStatus`] once either the readiness path or the timeout
/// path wins the `try_complete` race. Whichever path wins also removes
/// the timer entry and wakes the waiter; the loser observes the word
/// already set and drops its event.
pub(crate) struct PollInfo {
    pub(crate) fd: RawFd,
    /// This waiter's epoll user-data token.
    pub(crate) token: u64,
    /// Key of the pending timer entry, if one is registered. Taken (set
    /// to `None`) under the timer mutex by exactly one path: expiry,
    /// readiness completion, or cancellation.
    pub(crate) timer_key: Mutex<Option<TimerKey>>,
    pub(crate) waker: AtomicWaker,
    result: AtomicU32,
}

// === impl PollInfo ===

impl PollInfo {
    pub(crate) fn new(fd: RawFd, token: u64) -> Self {
        Self {
            fd,
            token,
            timer_key: Mutex::new(None),
            waker: AtomicWaker::new(),
            result: AtomicU32::new(RESULT_PENDING),
        }
    }

    /// Attempt to resolve the wait with `status`. Only one caller ever
    /// wins; the winner owns completion (timer removal, deregistration,
    /// waking).
    pub(crate) fn try_complete(&self, status: PollStatus) -> bool {
        self.result
            .compare_exchange(
                RESULT_PENDING,
                encode(status),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// The resolved status, once some path has completed the wait.
    pub(crate) fn result(&self) -> Option<PollStatus> {
        decode(self.result.load(Ordering::Acquire))
    }
}

fn encode(status: PollStatus) -> u32 {
    match status {
        PollStatus::Event => 1,
        PollStatus::Timeout => 2,
        PollStatus::Error => 3,
        PollStatus::Closed => 4,
    }
}

fn decode(raw: u32) -> Option<PollStatus> {
    match raw {
        RESULT_PENDING => None,
        1 => Some(PollStatus::Event),
        2 => Some(PollStatus::Timeout),
        3 => Some(PollStatus::Error),
        4 => Some(PollStatus::Closed),
        _ => unreachable!("corrupt poll result word"),
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn completion_is_at_most_once() {
        let info = PollInfo::new(-1, 3);
        assert_eq!(info.result(), None);

        assert!(info.try_complete(PollStatus::Event));
        // the racing timeout path loses and must drop its event
        assert!(!info.try_complete(PollStatus::Timeout));
        assert_eq!(info.result(), Some(PollStatus::Event));
    }
}
