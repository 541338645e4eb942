// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The reactor: timers, schedule wakeups, and fd readiness multiplexed
//! onto a single epoll instance.
//!
//! Three control eventfds — shutdown, timer, schedule-notify — are
//! registered with stable sentinel tokens; every other epoll registration
//! carries a token identifying a [`PollInfo`] in the reactor-owned
//! registration map. The reactor thread blocks on `epoll_wait`, resolves
//! each event, and resumes the affected waiters either inline on its own
//! trampoline or by handing them to the owned thread pool.

use crate::error::ScheduleError;
use crate::executor::{self, Executor, Reschedule};
use crate::io::poll_info::{PollInfo, PollOp, PollStatus, TimerKey};
use crate::task::{Task, TaskRef};
use crate::task_container::{self, GarbageCollect, TaskContainer};
use crate::thread_pool::{self, ThreadPool};
use core::mem;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::task::{Context, Poll};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Sentinel tokens for the three control fds. Waiter tokens start above
/// them, so the reactor can always tell a control event from a
/// [`PollInfo`] registration.
const SHUTDOWN_TOKEN: u64 = 0;
const TIMER_TOKEN: u64 = 1;
const SCHEDULE_TOKEN: u64 = 2;
const FIRST_WAITER_TOKEN: u64 = 3;

const MAX_EVENTS: usize = 16;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Whether the scheduler owns a dedicated reactor thread, or an external
/// thread drives it through [`IoScheduler::process_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadStrategy {
    #[default]
    Spawn,
    Manual,
}

/// Where computations resumed by the reactor continue executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// Hand resumed handles to the owned [`ThreadPool`].
    #[default]
    ProcessTasksOnThreadPool,
    /// Resume handles inline on the reactor thread, batched per reactor
    /// iteration.
    ProcessTasksInline,
}

/// Callback invoked on the reactor thread as it starts or stops.
pub type ReactorCallback = Arc<dyn Fn() + Send + Sync>;

/// Construction options for an [`IoScheduler`].
#[derive(Clone, Default)]
pub struct Options {
    pub thread_strategy: ThreadStrategy,
    pub execution_strategy: ExecutionStrategy,
    /// Invoked on the reactor thread before the first iteration
    /// (Spawn strategy only).
    pub on_io_thread_start: Option<ReactorCallback>,
    /// Invoked on the reactor thread after the last iteration
    /// (Spawn strategy only).
    pub on_io_thread_stop: Option<ReactorCallback>,
    /// Options for the owned pool (thread-pool execution strategy only).
    pub pool: thread_pool::Options,
}

/// A single-reactor multiplexer for timers, schedule wakeups, and fd
/// readiness.
///
/// Dropping the scheduler implies [`shutdown`](Self::shutdown): the
/// reactor drains its in-flight waiters and the owned
/// [`TaskContainer`] before any fd is closed.
pub struct IoScheduler {
    shared: Arc<Shared>,
    owned: TaskContainer<Shared>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct Shared {
    epoll_fd: RawFd,
    shutdown_fd: RawFd,
    timer_fd: RawFd,
    schedule_fd: RawFd,
    execution_strategy: ExecutionStrategy,
    /// Debounces schedule-fd writes: one eventfd write per batch of
    /// inline-scheduled handles.
    schedule_fd_triggered: AtomicBool,
    /// In-flight items owned by the reactor (inline-scheduled handles and
    /// pending waiters). The pool tracks its own share.
    size: AtomicUsize,
    shutdown_requested: AtomicBool,
    /// Guards manual `process_events` against concurrent entry.
    io_processing: AtomicBool,
    next_token: AtomicU64,
    /// Waiters currently registered with epoll, keyed by token.
    registrations: Mutex<HashMap<u64, Arc<PollInfo>>>,
    timed: Mutex<TimedEvents>,
    /// Handles scheduled inline, drained by the reactor per iteration.
    scheduled: Mutex<Vec<TaskRef>>,
    pool: Option<ThreadPool>,
}

/// The pending-timer multimap: earliest deadline first, ties broken by
/// insertion order (stable).
struct TimedEvents {
    events: BTreeMap<TimerKey, Arc<PollInfo>>,
    next_seq: u64,
}

// === impl IoScheduler ===

impl IoScheduler {
    /// Create the epoll instance, the three control fds, the owned task
    /// container, and — depending on the options — the worker pool and
    /// the dedicated reactor thread.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error when creating or registering the
    /// fds fails.
    pub fn new(opts: Options) -> io::Result<Self> {
        // Safety: plain syscall, flags are compile-time constants.
        let epoll_fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

        let make_eventfd = || -> io::Result<RawFd> {
            // Safety: plain syscall, flags are compile-time constants.
            cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })
        };

        let close_all = |fds: &[RawFd]| {
            for &fd in fds {
                // Safety: fds were created above and not handed out.
                unsafe { libc::close(fd) };
            }
        };

        let shutdown_fd = match make_eventfd() {
            Ok(fd) => fd,
            Err(error) => {
                close_all(&[epoll_fd]);
                return Err(error);
            }
        };
        // Safety: plain syscall, flags are compile-time constants.
        let timer_fd = match cvt(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        }) {
            Ok(fd) => fd,
            Err(error) => {
                close_all(&[epoll_fd, shutdown_fd]);
                return Err(error);
            }
        };
        let schedule_fd = match make_eventfd() {
            Ok(fd) => fd,
            Err(error) => {
                close_all(&[epoll_fd, shutdown_fd, timer_fd]);
                return Err(error);
            }
        };

        let pool = match opts.execution_strategy {
            ExecutionStrategy::ProcessTasksOnThreadPool => Some(ThreadPool::new(opts.pool.clone())),
            ExecutionStrategy::ProcessTasksInline => None,
        };

        let shared = Arc::new(Shared {
            epoll_fd,
            shutdown_fd,
            timer_fd,
            schedule_fd,
            execution_strategy: opts.execution_strategy,
            schedule_fd_triggered: AtomicBool::new(false),
            size: AtomicUsize::new(0),
            shutdown_requested: AtomicBool::new(false),
            io_processing: AtomicBool::new(false),
            next_token: AtomicU64::new(FIRST_WAITER_TOKEN),
            registrations: Mutex::new(HashMap::new()),
            timed: Mutex::new(TimedEvents {
                events: BTreeMap::new(),
                next_seq: 0,
            }),
            scheduled: Mutex::new(Vec::new()),
            pool,
        });

        shared.epoll_add(shutdown_fd, libc::EPOLLIN as u32, SHUTDOWN_TOKEN)?;
        shared.epoll_add(timer_fd, libc::EPOLLIN as u32, TIMER_TOKEN)?;
        shared.epoll_add(schedule_fd, libc::EPOLLIN as u32, SCHEDULE_TOKEN)?;

        let owned = TaskContainer::new(shared.clone(), task_container::Options::default());

        let io_thread = match opts.thread_strategy {
            ThreadStrategy::Spawn => {
                let shared = shared.clone();
                let on_start = opts.on_io_thread_start.clone();
                let on_stop = opts.on_io_thread_stop.clone();
                Some(
                    std::thread::Builder::new()
                        .name("exio-reactor".into())
                        .spawn(move || Shared::run_dedicated(&shared, on_start, on_stop))
                        .expect("failed to spawn reactor thread"),
                )
            }
            ThreadStrategy::Manual => None,
        };

        Ok(Self {
            shared,
            owned,
            io_thread: Mutex::new(io_thread),
        })
    }

    /// An awaitable that re-schedules the awaiting computation onto this
    /// scheduler: onto the owned pool, or onto the reactor's inline batch.
    ///
    /// # Errors
    ///
    /// Fails with [`ScheduleError`] once [`shutdown`](Self::shutdown) has
    /// been requested.
    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        if self.shared.shutdown_requested.load(Ordering::Relaxed) {
            return Err(ScheduleError(()));
        }
        Ok(Schedule {
            inner: Reschedule::onto(self.shared.clone()),
        })
    }

    /// Submit a detached task; the owned [`TaskContainer`] stores it,
    /// runs it on this scheduler, and reclaims it when it finishes.
    pub fn schedule_task(&self, task: Task<()>) {
        self.owned.start(task, GarbageCollect::Yes);
    }

    /// Suspend the awaiting computation for `amount`.
    pub async fn schedule_after(&self, amount: Duration) {
        self.yield_for(amount).await;
    }

    /// Suspend the awaiting computation until `deadline`.
    pub async fn schedule_at(&self, deadline: Instant) {
        self.yield_until(deadline).await;
    }

    /// Re-schedule the awaiting computation, granting other ready handles
    /// a turn.
    ///
    /// # Errors
    ///
    /// Fails with [`ScheduleError`] once [`shutdown`](Self::shutdown) has
    /// been requested.
    pub fn yield_now(&self) -> Result<Schedule, ScheduleError> {
        self.schedule()
    }

    /// Suspend the awaiting computation for `amount`, implemented as a
    /// pure timer registration.
    pub async fn yield_for(&self, amount: Duration) {
        let shared = self.shared.clone();
        let _in_flight = InFlightGuard::new(shared.clone());

        let token = shared.next_token.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(PollInfo::new(-1, token));
        shared.add_timer_token(Instant::now() + amount, &info);

        let _ = PollReady::new(shared, info).await;
    }

    /// Suspend the awaiting computation until `deadline`.
    pub async fn yield_until(&self, deadline: Instant) {
        let amount = deadline.saturating_duration_since(Instant::now());
        self.yield_for(amount).await;
    }

    /// Wait until `fd` is ready for `op`, or until `timeout` passes.
    ///
    /// The readiness and timeout paths race through the wait record's
    /// one-shot completion word, so the waiter resumes exactly once with
    /// the winning status. Registration failures resolve to
    /// [`PollStatus::Error`] rather than raising.
    pub async fn poll(&self, fd: RawFd, op: PollOp, timeout: Option<Duration>) -> PollStatus {
        let shared = self.shared.clone();
        let _in_flight = InFlightGuard::new(shared.clone());

        let token = shared.next_token.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(PollInfo::new(fd, token));
        shared.registrations.lock().insert(token, info.clone());

        if let Some(timeout) = timeout {
            shared.add_timer_token(Instant::now() + timeout, &info);
        }

        // register interest last: from here on the reactor may resolve
        // the waiter at any moment
        #[allow(clippy::cast_sign_loss, reason = "epoll event bits are a bitmask")]
        let events = op.events() | libc::EPOLLONESHOT as u32 | libc::EPOLLRDHUP as u32;
        if let Err(error) = shared.epoll_add(fd, events, token) {
            tracing::error!(fd, %error, "failed to register fd with the reactor");
            shared.remove_timer_token(&info);
            shared.registrations.lock().remove(&token);
            return PollStatus::Error;
        }

        PollReady::new(shared, info).await
    }

    /// Enqueue a bare suspended handle for resumption by this scheduler.
    pub fn resume(&self, task: TaskRef) {
        self.shared.resume(task);
    }

    /// Perform one reactor iteration from the calling thread
    /// (manual thread strategy); returns the in-flight count.
    pub fn process_events(&self, timeout: Duration) -> usize {
        if !self.shared.io_processing.swap(true, Ordering::AcqRel) {
            Shared::process_events_execute(&self.shared, timeout);
            self.shared.io_processing.store(false, Ordering::Release);
        }
        self.size()
    }

    /// In-flight items: the reactor's own, plus the pool's when one is
    /// attached.
    pub fn size(&self) -> usize {
        self.shared.total_size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Request shutdown and join the reactor thread. Idempotent. The
    /// reactor finishes draining its in-flight waiters before exiting.
    pub fn shutdown(&self) {
        if !self.shared.shutdown_requested.swap(true, Ordering::AcqRel) {
            write_eventfd(self.shared.shutdown_fd);
        }

        let thread = self.io_thread.lock().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

impl Executor for IoScheduler {
    fn resume(&self, task: TaskRef) {
        self.shared.resume(task);
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.shutdown();

        // drain the owned container before the fds go away; without a
        // dedicated reactor thread the remaining iterations run here
        while !self.owned.is_empty() {
            self.owned.garbage_collect();
            if self.owned.is_empty() {
                break;
            }
            Shared::process_events_execute(&self.shared, Duration::from_millis(10));
        }

        if let Some(pool) = &self.shared.pool {
            pool.shutdown();
        }
    }
}

// === impl Shared ===

impl Shared {
    /// The reactor main loop for the dedicated thread: keeps iterating
    /// until shutdown has been requested *and* the in-flight count has
    /// drained.
    fn run_dedicated(
        this: &Arc<Self>,
        on_start: Option<ReactorCallback>,
        on_stop: Option<ReactorCallback>,
    ) {
        if let Some(on_start) = &on_start {
            on_start();
        }

        let _span = tracing::debug_span!("reactor").entered();
        tracing::debug!("reactor started");

        while !this.shutdown_requested.load(Ordering::Acquire) || this.total_size() > 0 {
            Self::process_events_execute(this, DEFAULT_TIMEOUT);
        }

        tracing::debug!("reactor stopped");

        if let Some(on_stop) = &on_stop {
            on_stop();
        }
    }

    /// One reactor iteration: wait for events, resolve each, and resume
    /// the collected waiters as a batch once the iteration's trampoline
    /// drains.
    fn process_events_execute(this: &Arc<Self>, timeout: Duration) {
        executor::enter(|| {
            let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
            #[allow(clippy::cast_possible_truncation, reason = "timeout is clamped")]
            let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

            // Safety: the events buffer outlives the call and its length
            // is passed alongside.
            let count = unsafe {
                libc::epoll_wait(
                    this.epoll_fd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    timeout_ms,
                )
            };

            if count < 0 {
                let error = io::Error::last_os_error();
                if error.kind() != io::ErrorKind::Interrupted {
                    tracing::warn!(%error, "epoll_wait failed");
                }
                return;
            }

            #[allow(clippy::cast_sign_loss, reason = "count is non-negative here")]
            for event in &events[..count as usize] {
                let token = event.u64;
                match token {
                    SHUTDOWN_TOKEN => drain_eventfd(this.shutdown_fd),
                    TIMER_TOKEN => this.process_timeout_execute(),
                    SCHEDULE_TOKEN => {
                        drain_eventfd(this.schedule_fd);
                        this.schedule_fd_triggered.store(false, Ordering::Release);
                        this.process_scheduled_execute_inline();
                    }
                    token => {
                        let info = this.registrations.lock().get(&token).cloned();
                        if let Some(info) = info {
                            this.process_event_execute(&info, event_to_poll_status(event.events));
                        }
                    }
                }
            }
        });
    }

    /// Resolve a readiness event for one waiter.
    fn process_event_execute(&self, info: &Arc<PollInfo>, status: PollStatus) {
        if !info.try_complete(status) {
            // the timeout path won; drop the event
            return;
        }

        self.remove_timer_token(info);
        self.registrations.lock().remove(&info.token);
        self.epoll_del(info.fd);
        self.dispatch_waiter(info);
    }

    /// Fire every timer whose deadline has passed, re-arming the timer fd
    /// for the new earliest entry.
    fn process_timeout_execute(&self) {
        drain_timerfd(self.timer_fd);

        let expired = {
            let mut timed = self.timed.lock();
            let now = Instant::now();
            let mut expired = Vec::new();

            while let Some(entry) = timed.events.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let (_, info) = entry.remove_entry();
                *info.timer_key.lock() = None;
                expired.push(info);
            }

            self.update_timeout_locked(&timed);
            expired
        };

        for info in expired {
            if info.try_complete(PollStatus::Timeout) {
                self.registrations.lock().remove(&info.token);
                self.epoll_del(info.fd);
                self.dispatch_waiter(&info);
            }
        }
    }

    /// Move the inline-scheduled handles into the current iteration's
    /// resume batch.
    fn process_scheduled_execute_inline(&self) {
        let tasks: Vec<TaskRef> = mem::take(&mut *self.scheduled.lock());
        if tasks.is_empty() {
            return;
        }

        self.size.fetch_sub(tasks.len(), Ordering::Release);
        for task in tasks {
            executor::schedule_local(task);
        }
    }

    /// Resume a completed waiter: inline (deferred to the iteration's
    /// batch) or via the owned pool.
    fn dispatch_waiter(&self, info: &Arc<PollInfo>) {
        let Some(waker) = info.waker.take() else {
            // the waiter has not been polled yet; it observes the result
            // word on its first poll
            return;
        };

        match self.execution_strategy {
            ExecutionStrategy::ProcessTasksInline => waker.wake(),
            ExecutionStrategy::ProcessTasksOnThreadPool => self
                .pool
                .as_ref()
                .expect("thread-pool strategy without a pool, this is a bug")
                .resume(TaskRef::from_waker(waker)),
        }
    }

    /// Register a timer entry and re-arm the timer fd.
    fn add_timer_token(&self, deadline: Instant, info: &Arc<PollInfo>) {
        let mut timed = self.timed.lock();
        let key: TimerKey = (deadline, timed.next_seq);
        timed.next_seq += 1;
        timed.events.insert(key, info.clone());
        *info.timer_key.lock() = Some(key);
        self.update_timeout_locked(&timed);
    }

    /// Remove a waiter's timer entry, if it still owns one.
    fn remove_timer_token(&self, info: &Arc<PollInfo>) {
        let mut timed = self.timed.lock();
        if let Some(key) = info.timer_key.lock().take() {
            timed.events.remove(&key);
            self.update_timeout_locked(&timed);
        }
    }

    /// Arm the timer fd for the earliest pending deadline, or disarm it
    /// when no timers remain.
    fn update_timeout_locked(&self, timed: &TimedEvents) {
        let next = timed
            .events
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()));
        arm_timerfd(self.timer_fd, next);
    }

    fn total_size(&self) -> usize {
        let own = self.size.load(Ordering::Acquire);
        match &self.pool {
            Some(pool) => own + pool.size(),
            None => own,
        }
    }

    fn epoll_add(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        // Safety: the event struct lives across the call; epoll copies it.
        cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) })?;
        Ok(())
    }

    fn epoll_del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        // Safety: DEL takes no event argument.
        let ret =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, core::ptr::null_mut()) };
        if ret < 0 {
            let error = io::Error::last_os_error();
            // ENOENT / EBADF are expected when the fd was already closed
            // or never made it into the interest list
            if error.raw_os_error() != Some(libc::ENOENT)
                && error.raw_os_error() != Some(libc::EBADF)
            {
                tracing::warn!(fd, %error, "failed to deregister fd");
            }
        }
    }
}

impl Executor for Shared {
    fn resume(&self, task: TaskRef) {
        match self.execution_strategy {
            ExecutionStrategy::ProcessTasksInline => {
                self.size.fetch_add(1, Ordering::Release);
                self.scheduled.lock().push(task);

                // one eventfd write per batch
                if self
                    .schedule_fd_triggered
                    .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    write_eventfd(self.schedule_fd);
                }
            }
            ExecutionStrategy::ProcessTasksOnThreadPool => {
                self.pool
                    .as_ref()
                    .expect("thread-pool strategy without a pool, this is a bug")
                    .resume(task);
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for fd in [
            self.epoll_fd,
            self.shutdown_fd,
            self.timer_fd,
            self.schedule_fd,
        ] {
            // Safety: the fds are owned by this struct and nothing can
            // reference them once the last handle drops.
            unsafe { libc::close(fd) };
        }
    }
}

/// Awaitable returned by [`IoScheduler::schedule`] and
/// [`IoScheduler::yield_now`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Schedule {
    inner: Reschedule,
}

impl Future for Schedule {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

/// Completion future over a [`PollInfo`]; cleans the registration up when
/// dropped before either race path resolved it.
struct PollReady {
    shared: Arc<Shared>,
    info: Arc<PollInfo>,
    done: bool,
}

// === impl PollReady ===

impl PollReady {
    fn new(shared: Arc<Shared>, info: Arc<PollInfo>) -> Self {
        Self {
            shared,
            info,
            done: false,
        }
    }
}

impl Future for PollReady {
    type Output = PollStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(status) = self.info.result() {
            self.done = true;
            return Poll::Ready(status);
        }

        self.info.waker.register(cx.waker());

        // re-check: completion may have raced the registration
        if let Some(status) = self.info.result() {
            self.done = true;
            return Poll::Ready(status);
        }
        Poll::Pending
    }
}

impl Drop for PollReady {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // abandoned mid-wait: win the completion race ourselves so
        // neither reactor path touches a dead waiter
        if self.info.try_complete(PollStatus::Error) {
            self.shared.remove_timer_token(&self.info);
            self.shared.registrations.lock().remove(&self.info.token);
            self.shared.epoll_del(self.info.fd);
        }
    }
}

/// Counts one in-flight item on the reactor for the guard's lifetime.
struct InFlightGuard {
    shared: Arc<Shared>,
}

impl InFlightGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.size.fetch_add(1, Ordering::Release);
        Self { shared }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.size.fetch_sub(1, Ordering::Release);
    }
}

fn event_to_poll_status(events: u32) -> PollStatus {
    #[allow(clippy::cast_sign_loss, reason = "epoll event bits are a bitmask")]
    let (ready, error, closed) = (
        (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        libc::EPOLLERR as u32,
        (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32,
    );

    if events & ready != 0 {
        PollStatus::Event
    } else if events & error != 0 {
        PollStatus::Error
    } else if events & closed != 0 {
        PollStatus::Closed
    } else {
        PollStatus::Error
    }
}

fn cvt(ret: libc::c_int) -> io::Result<RawFd> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn write_eventfd(fd: RawFd) {
    let value: u64 = 1;
    // Safety: writes 8 bytes from a live stack value.
    unsafe {
        libc::write(fd, (&raw const value).cast(), 8);
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut value: u64 = 0;
    // Safety: reads at most 8 bytes into a live stack value.
    unsafe {
        libc::read(fd, (&raw mut value).cast(), 8);
    }
}

fn drain_timerfd(fd: RawFd) {
    drain_eventfd(fd);
}

/// Arm (or disarm, with `None`) the timer fd with a relative deadline.
fn arm_timerfd(fd: RawFd, next: Option<Duration>) {
    let zero = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let it_value = match next {
        Some(delta) => {
            // a zero it_value disarms the timer; clamp to one nanosecond
            let delta = delta.max(Duration::from_nanos(1));
            #[allow(
                clippy::cast_possible_wrap,
                reason = "deadlines are bounded well below time_t range"
            )]
            let tv_sec = delta.as_secs() as libc::time_t;
            #[allow(clippy::cast_possible_wrap, reason = "sub-second nanos fit in c_long")]
            let tv_nsec = delta.subsec_nanos() as libc::c_long;
            libc::timespec { tv_sec, tv_nsec }
        }
        None => zero,
    };
    let spec = libc::itimerspec {
        it_interval: zero,
        it_value,
    };

    // Safety: the spec lives across the call; the kernel copies it.
    let ret = unsafe { libc::timerfd_settime(fd, 0, &spec, core::ptr::null_mut()) };
    if ret < 0 {
        let error = io::Error::last_os_error();
        tracing::warn!(%error, "failed to arm timer fd");
    }
}
