// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness multiplexing: the [`IoScheduler`] reactor and its poll
//! surface.

mod poll_info;
mod scheduler;

pub use poll_info::{PollOp, PollStatus};
pub use scheduler::{
    ExecutionStrategy, IoScheduler, Options, ReactorCallback, Schedule, ThreadStrategy,
};

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::sync_wait::sync_wait;
    use crate::task::Task;
    use crate::test_util::trace_init;
    use crate::thread_pool;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::os::unix::io::RawFd;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn scheduler(execution: ExecutionStrategy) -> Arc<IoScheduler> {
        Arc::new(
            IoScheduler::new(Options {
                execution_strategy: execution,
                pool: thread_pool::Options {
                    thread_count: Some(2),
                    ..thread_pool::Options::default()
                },
                ..Options::default()
            })
            .expect("failed to build scheduler"),
        )
    }

    /// A nonblocking pipe; closed by the test.
    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        // Safety: fds points at two writable ints.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0, "pipe2 failed");
        (fds[0], fds[1])
    }

    fn write_byte(fd: RawFd) {
        // Safety: writes one byte from a live buffer.
        let ret = unsafe { libc::write(fd, b"x".as_ptr().cast(), 1) };
        assert_eq!(ret, 1);
    }

    fn close_fd(fd: RawFd) {
        // Safety: fd is owned by the test.
        unsafe { libc::close(fd) };
    }

    #[test]
    fn readiness_beats_timeout() {
        let _trace = trace_init();
        let io = scheduler(ExecutionStrategy::ProcessTasksOnThreadPool);
        let (read_fd, write_fd) = pipe();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            write_byte(write_fd);
        });

        let scheduler = io.clone();
        let status = sync_wait(async move {
            scheduler
                .poll(read_fd, PollOp::Read, Some(Duration::from_secs(5)))
                .await
        });

        assert_eq!(status, PollStatus::Event);
        writer.join().unwrap();

        io.shutdown();
        assert!(io.is_empty());
        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[test]
    fn timeout_fires_when_no_data_arrives() {
        let _trace = trace_init();
        let io = scheduler(ExecutionStrategy::ProcessTasksOnThreadPool);
        let (read_fd, write_fd) = pipe();

        let scheduler = io.clone();
        let begin = Instant::now();
        let status = sync_wait(async move {
            scheduler
                .poll(read_fd, PollOp::Read, Some(Duration::from_millis(50)))
                .await
        });

        assert_eq!(status, PollStatus::Timeout);
        assert!(begin.elapsed() >= Duration::from_millis(50));

        io.shutdown();
        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[test]
    fn poll_reports_peer_close() {
        let _trace = trace_init();
        let io = scheduler(ExecutionStrategy::ProcessTasksOnThreadPool);
        let (read_fd, write_fd) = pipe();

        close_fd(write_fd);

        let scheduler = io.clone();
        let status = sync_wait(async move {
            scheduler
                .poll(read_fd, PollOp::Read, Some(Duration::from_secs(5)))
                .await
        });

        // a widowed pipe reports HUP readiness
        assert!(matches!(status, PollStatus::Closed | PollStatus::Event));

        io.shutdown();
        close_fd(read_fd);
    }

    #[test]
    fn yield_for_waits_at_least_the_requested_time() {
        let _trace = trace_init();
        let io = scheduler(ExecutionStrategy::ProcessTasksOnThreadPool);

        let scheduler = io.clone();
        let begin = Instant::now();
        sync_wait(async move { scheduler.yield_for(Duration::from_millis(40)).await });

        assert!(begin.elapsed() >= Duration::from_millis(40));
        io.shutdown();
    }

    #[test]
    fn yield_until_a_past_deadline_completes_promptly() {
        let io = scheduler(ExecutionStrategy::ProcessTasksOnThreadPool);

        let scheduler = io.clone();
        sync_wait(async move { scheduler.yield_until(Instant::now()).await });
        io.shutdown();
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let _trace = trace_init();
        let io = scheduler(ExecutionStrategy::ProcessTasksOnThreadPool);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let tasks: Vec<_> = [50u64, 10, 30]
            .into_iter()
            .map(|ms| {
                let scheduler = io.clone();
                let order = order.clone();
                async move {
                    scheduler.yield_for(Duration::from_millis(ms)).await;
                    order.lock().push(ms);
                }
            })
            .collect();

        sync_wait(crate::sync::when_all::when_all(tasks));

        assert_eq!(*order.lock(), vec![10, 30, 50]);
        io.shutdown();
    }

    #[test]
    fn schedule_moves_execution_off_the_caller() {
        let _trace = trace_init();
        let io = scheduler(ExecutionStrategy::ProcessTasksOnThreadPool);

        let caller = std::thread::current().id();
        let scheduler = io.clone();
        let ran_on = sync_wait(async move {
            scheduler.schedule().unwrap().await;
            std::thread::current().id()
        });

        assert_ne!(ran_on, caller);
        io.shutdown();
        assert!(io.schedule().is_err());
    }

    #[test]
    fn inline_strategy_resumes_on_the_reactor() {
        let _trace = trace_init();
        let io = scheduler(ExecutionStrategy::ProcessTasksInline);

        let caller = std::thread::current().id();
        let scheduler = io.clone();
        let ran_on = sync_wait(async move {
            scheduler.schedule().unwrap().await;
            std::thread::current().id()
        });

        assert_ne!(ran_on, caller);
        io.shutdown();
    }

    #[test]
    fn manual_mode_is_driven_by_process_events() {
        let _trace = trace_init();
        let io = IoScheduler::new(Options {
            thread_strategy: ThreadStrategy::Manual,
            execution_strategy: ExecutionStrategy::ProcessTasksInline,
            ..Options::default()
        })
        .expect("failed to build scheduler");
        let io = Arc::new(io);

        let done = Arc::new(AtomicBool::new(false));
        {
            let scheduler = io.clone();
            let done = done.clone();
            io.schedule_task(Task::new(async move {
                scheduler.yield_for(Duration::from_millis(10)).await;
                done.store(true, Ordering::Release);
            }));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !done.load(Ordering::Acquire) {
            assert!(Instant::now() < deadline, "reactor made no progress");
            io.process_events(Duration::from_millis(10));
        }
    }

    #[test]
    fn drop_drains_detached_tasks_before_closing_fds() {
        use crate::sync::event::{Event, ResumeOrderPolicy};

        let _trace = trace_init();
        let io = IoScheduler::new(Options {
            pool: thread_pool::Options {
                thread_count: Some(2),
                ..thread_pool::Options::default()
            },
            ..Options::default()
        })
        .expect("failed to build scheduler");

        let gate = Arc::new(Event::new(false));
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let gate = gate.clone();
            let completed = completed.clone();
            io.schedule_task(Task::new(async move {
                gate.wait().await;
                completed.fetch_add(1, Ordering::Relaxed);
            }));
        }

        let setter = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                gate.set(ResumeOrderPolicy::Lifo);
            })
        };

        // dropping with tasks in flight must block on the drain
        drop(io);

        assert_eq!(completed.load(Ordering::Relaxed), 4);
        setter.join().unwrap();
    }

    #[test]
    fn schedule_task_runs_detached_work() {
        let _trace = trace_init();
        let io = scheduler(ExecutionStrategy::ProcessTasksOnThreadPool);

        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            io.schedule_task(Task::new(async move {
                done.store(true, Ordering::Release);
            }));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !done.load(Ordering::Acquire) {
            assert!(Instant::now() < deadline, "detached task never ran");
            std::thread::yield_now();
        }
        io.shutdown();
    }
}
