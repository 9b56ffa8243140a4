// The MIT License (MIT)

// Copyright (c) 2015 Y. T. Chung <zonyitoo@gmail.com>

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Event-driven I/O scheduler
//!
//! The scheduler multiplexes coroutine frames over one OS readiness facility.
//! It owns the poll set, a timed-events map whose nearest deadline bounds
//! every OS wait, a user-signal waker shared by the shutdown and schedule
//! paths, a container of detached tasks, and (in throughput mode) an embedded
//! worker pool. The event loop runs on a dedicated background thread or under
//! manual [`IoScheduler::process_events`] calls.
//!
//! Every suspension on the scheduler is tracked by an exactly-once record: an
//! fd readiness event, a timer expiry, or a cancellation may each try to
//! complete a wait, and whichever arrives first wins while the others are
//! suppressed and their counterpart subscriptions removed.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::thread::{self, Builder};
use std::time::{Duration, Instant};

use log::{trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Token};
use slab::Slab;

use super::coroutine::{spawn_raw, Handle, Schedule};
use super::task_container::TaskContainer;
use super::thread_pool::{self, ThreadPool};
use super::{ScheduleNotify, Work};
use crate::error::ScheduleError;
use crate::poll::{classify, PollOp, PollStatus};
use crate::task::Task;

/// Token reserved for the user-signal waker (shutdown + schedule signal).
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Low 32 bits of a token address the wait slot; the high bits carry a
/// generation so a recycled slot cannot match a stale readiness event.
const TOKEN_INDEX_MASK: usize = 0xffff_ffff;

/// How the event loop is driven.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadStrategy {
    /// Spawn a dedicated background thread for the event loop.
    Spawn,
    /// The caller drives the loop through [`IoScheduler::process_events`].
    Manual,
}

/// Where resumed coroutine frames execute.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionStrategy {
    /// Frames are FIFO-queued onto an embedded worker pool. Better for long
    /// lived, CPU heavy tasks that would otherwise stall the event loop.
    ThreadPool,
    /// Frames resume inline on the event-loop thread. Better for short tasks
    /// where the pool hand-off latency dominates.
    Inline,
}

/// Hook invoked on the event-loop thread as it starts or stops.
pub type IoHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// I/O scheduler configuration.
#[derive(Clone)]
pub struct Options {
    thread_strategy: ThreadStrategy,
    execution_strategy: ExecutionStrategy,
    pool: thread_pool::Options,
    on_io_thread_start: Option<IoHook>,
    on_io_thread_stop: Option<IoHook>,
}

impl Options {
    pub fn new() -> Options {
        Options {
            thread_strategy: ThreadStrategy::Spawn,
            execution_strategy: ExecutionStrategy::ThreadPool,
            pool: thread_pool::Options::new(),
            on_io_thread_start: None,
            on_io_thread_stop: None,
        }
    }

    /// Set whether the scheduler spawns a dedicated event thread.
    ///
    /// Default is [`ThreadStrategy::Spawn`].
    pub fn thread_strategy(mut self, strategy: ThreadStrategy) -> Options {
        self.thread_strategy = strategy;
        self
    }

    /// Set where resumed frames execute.
    ///
    /// Default is [`ExecutionStrategy::ThreadPool`].
    pub fn execution_strategy(mut self, strategy: ExecutionStrategy) -> Options {
        self.execution_strategy = strategy;
        self
    }

    /// Configure the embedded worker pool (throughput mode only).
    pub fn pool(mut self, pool: thread_pool::Options) -> Options {
        self.pool = pool;
        self
    }

    /// Set a callback to run as the event-loop thread starts.
    pub fn on_io_thread_start<F>(mut self, f: F) -> Options
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_io_thread_start = Some(Arc::new(f));
        self
    }

    /// Set a callback to run before the event-loop thread exits.
    pub fn on_io_thread_stop<F>(mut self, f: F) -> Options
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_io_thread_stop = Some(Arc::new(f));
        self
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}

/// The OS poll set plus its reusable event buffer. Holding this lock implies
/// the exclusive right to run one pass of the event loop.
struct Driver {
    poll: mio::Poll,
    events: Events,
}

struct WaitState {
    /// Exactly-once delivery flag: whichever of {event, timer, cancellation}
    /// flips it first wins; later notifications for this record are dropped.
    processed: bool,
    status: Option<PollStatus>,
    waker: Option<Waker>,
    /// Wait-slot token while the fd subscription is live.
    token: Option<usize>,
    /// Position inside the timed-events map while the timer is live.
    timer_key: Option<(Instant, u64)>,
}

/// Per-suspension record for an I/O or timer wait. Created by the suspending
/// frame, completed by the event loop, released when the frame resumes or the
/// wait is dropped.
struct PollWait {
    /// `None` for a pure timer wait.
    fd: Option<RawFd>,
    state: Mutex<WaitState>,
}

impl PollWait {
    fn new(fd: Option<RawFd>, waker: Waker) -> Arc<PollWait> {
        Arc::new(PollWait {
            fd,
            state: Mutex::new(WaitState {
                processed: false,
                status: None,
                waker: Some(waker),
                token: None,
                timer_key: None,
            }),
        })
    }
}

struct Shared {
    /// Cross-thread clone of the poll set's registration interface.
    registry: mio::Registry,
    /// The combined shutdown/schedule user signal.
    waker: mio::Waker,
    driver: Mutex<Driver>,
    /// Embedded worker pool; present in throughput mode only.
    pool: Option<ThreadPool>,
    /// Live fd subscriptions, keyed by the index half of their token.
    waits: Mutex<Slab<(u64, Arc<PollWait>)>>,
    wait_gen: AtomicU64,
    /// Deadline-ordered timer entries; duplicates disambiguated by sequence.
    timed: Mutex<BTreeMap<(Instant, u64), Arc<PollWait>>>,
    timer_seq: AtomicU64,
    /// Work to resume on the event-loop thread (latency mode).
    inline_ready: Mutex<Vec<Work>>,
    /// Deduplicates schedule-signal wake-ups under bursty scheduling.
    schedule_signal_pending: AtomicBool,
    shutdown_requested: AtomicBool,
    /// Scheduler-owned suspensions currently in flight.
    active: AtomicUsize,
    idle_lock: Mutex<()>,
    idle_cond: Condvar,
    container: TaskContainer,
}

impl Schedule for Shared {
    fn schedule(&self, handle: Handle) {
        self.route(Work::Run(handle));
    }
}

impl Shared {
    /// Hands a unit of work to the configured execution side.
    fn route(&self, work: Work) {
        match &self.pool {
            Some(pool) => pool.shared().push(work),
            None => {
                {
                    self.inline_ready.lock().unwrap().push(work);
                }
                if self
                    .schedule_signal_pending
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.waker.wake();
                }
            }
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Suspensions in flight plus detached tasks not yet completed.
    fn outstanding(&self) -> usize {
        self.active.load(Ordering::Acquire) + self.container.size()
    }

    fn notify_idle(&self) {
        let _guard = self.idle_lock.lock().unwrap();
        self.idle_cond.notify_all();
    }

    fn inc_active(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_active(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify_idle();
        }
    }

    /// Adds a timer entry and rearms the OS wait if it became the nearest
    /// deadline.
    fn insert_timer(&self, deadline: Instant, wait: Arc<PollWait>) -> (Instant, u64) {
        let key = (deadline, self.timer_seq.fetch_add(1, Ordering::Relaxed));
        let is_new_head = {
            let mut timed = self.timed.lock().unwrap();
            let head = timed.keys().next().copied();
            timed.insert(key, wait);
            head.map_or(true, |head| key < head)
        };
        if is_new_head {
            let _ = self.waker.wake();
        }
        key
    }

    /// Registers an fd subscription, returning its token.
    fn register_fd(&self, fd: RawFd, op: PollOp, wait: Arc<PollWait>) -> io::Result<usize> {
        let token = {
            let mut waits = self.waits.lock().unwrap();
            let gen = self.wait_gen.fetch_add(1, Ordering::Relaxed) & TOKEN_INDEX_MASK as u64;
            let index = waits.insert((gen, wait));
            assert!(index <= TOKEN_INDEX_MASK, "wait slot index overflow");
            index | (gen as usize) << 32
        };
        let mut source = SourceFd(&fd);
        match self.registry.register(&mut source, Token(token), op.interest()) {
            Ok(()) => Ok(token),
            Err(err) => {
                let mut waits = self.waits.lock().unwrap();
                waits.remove(token & TOKEN_INDEX_MASK);
                Err(err)
            }
        }
    }

    fn lookup(&self, token: usize) -> Option<Arc<PollWait>> {
        let index = token & TOKEN_INDEX_MASK;
        let gen = (token >> 32) as u64;
        let waits = self.waits.lock().unwrap();
        match waits.get(index) {
            Some((stored_gen, wait)) if *stored_gen == gen => Some(wait.clone()),
            _ => None,
        }
    }

    /// Completes a wait with `status` if it has not been completed yet, and
    /// removes whatever subscriptions it still holds. Returns the waker to
    /// resume, which the caller fires only after the whole batch in progress
    /// has been classified.
    fn deliver(&self, wait: &Arc<PollWait>, status: PollStatus) -> Option<Waker> {
        let (waker, token, timer_key) = {
            let mut state = wait.state.lock().unwrap();
            if state.processed {
                return None;
            }
            state.processed = true;
            state.status = Some(status);
            (state.waker.take(), state.token.take(), state.timer_key.take())
        };

        if let Some(token) = token {
            {
                let mut waits = self.waits.lock().unwrap();
                let index = token & TOKEN_INDEX_MASK;
                if waits.contains(index) {
                    waits.remove(index);
                }
            }
            if let Some(fd) = wait.fd {
                let mut source = SourceFd(&fd);
                let _ = self.registry.deregister(&mut source);
            }
        }
        if let Some(key) = timer_key {
            self.timed.lock().unwrap().remove(&key);
        }
        waker
    }

    /// Cancellation path used when a wait future is dropped mid-suspension.
    fn cancel_wait(&self, wait: &Arc<PollWait>) {
        let _ = self.deliver(wait, PollStatus::Error);
    }

    /// One pass of the event loop: wait on the OS, classify the whole batch
    /// of readiness events and expired timers, then resume.
    fn turn(&self, timeout: Option<Duration>) {
        let mut wakers: Vec<Waker> = Vec::new();

        {
            let mut driver = self.driver.lock().unwrap();

            let now = Instant::now();
            let until_timer = {
                let timed = self.timed.lock().unwrap();
                timed
                    .keys()
                    .next()
                    .map(|(when, _)| when.saturating_duration_since(now))
            };
            let poll_timeout = match (timeout, until_timer) {
                (None, None) => None,
                (Some(t), None) => Some(t),
                (None, Some(d)) => Some(d),
                (Some(t), Some(d)) => Some(t.min(d)),
            };

            let Driver { poll, events } = &mut *driver;
            match poll.poll(events, poll_timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                // A broken poll handle cannot be recovered from.
                Err(err) => panic!("OS poll failed: {}", err),
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    // The signal itself carries nothing; the lists below are
                    // drained on every pass.
                    continue;
                }
                if let Some(wait) = self.lookup(token.0) {
                    if let Some(waker) = self.deliver(&wait, classify(event)) {
                        wakers.push(waker);
                    }
                }
            }
        }

        // Expired timers belong to the same batch as the events above: an fd
        // event and its timer may fire together, and the loser must observe
        // the processed flag rather than a resumed (and possibly dead) frame.
        let expired: Vec<Arc<PollWait>> = {
            let mut timed = self.timed.lock().unwrap();
            let now = Instant::now();
            let still_pending = timed.split_off(&(now + Duration::from_nanos(1), 0));
            mem::replace(&mut *timed, still_pending)
                .into_values()
                .collect()
        };
        for wait in expired {
            let status = if wait.fd.is_none() {
                PollStatus::Event
            } else {
                PollStatus::Timeout
            };
            if let Some(waker) = self.deliver(&wait, status) {
                wakers.push(waker);
            }
        }

        // Only now, with the batch fully classified, resume the frames.
        for waker in wakers {
            waker.wake();
        }

        // Drain the inline ready list in append order on this thread.
        let ready: Vec<Work> = {
            let mut ready = self.inline_ready.lock().unwrap();
            self.schedule_signal_pending.store(false, Ordering::Release);
            mem::take(&mut *ready)
        };
        for work in ready {
            work.complete();
        }
    }
}

fn io_loop(shared: Arc<Shared>, on_start: Option<IoHook>, on_stop: Option<IoHook>) {
    if let Some(hook) = &on_start {
        hook();
    }
    trace!("io: event loop starts");

    loop {
        if shared.is_shut_down() && shared.outstanding() == 0 {
            break;
        }
        shared.turn(Some(Duration::from_millis(1000)));
    }

    trace!("io: event loop is shutdown");
    if let Some(hook) = &on_stop {
        hook();
    }
}

/// Event-driven coroutine scheduler over the OS readiness facility.
pub struct IoScheduler {
    shared: Arc<Shared>,
    thread_strategy: ThreadStrategy,
    io_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoScheduler {
    /// Creates a scheduler. With [`ThreadStrategy::Spawn`] the event loop
    /// starts immediately on a dedicated thread.
    pub fn new(opts: Options) -> io::Result<Arc<IoScheduler>> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        let pool = match opts.execution_strategy {
            ExecutionStrategy::ThreadPool => Some(ThreadPool::new(opts.pool.clone())),
            ExecutionStrategy::Inline => None,
        };

        let shared = Arc::new(Shared {
            registry,
            waker,
            driver: Mutex::new(Driver {
                poll,
                events: Events::with_capacity(1024),
            }),
            pool,
            waits: Mutex::new(Slab::new()),
            wait_gen: AtomicU64::new(0),
            timed: Mutex::new(BTreeMap::new()),
            timer_seq: AtomicU64::new(0),
            inline_ready: Mutex::new(Vec::new()),
            schedule_signal_pending: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle_cond: Condvar::new(),
            container: TaskContainer::new(8),
        });

        let scheduler = Arc::new(IoScheduler {
            shared: shared.clone(),
            thread_strategy: opts.thread_strategy,
            io_thread: Mutex::new(None),
        });

        if opts.thread_strategy == ThreadStrategy::Spawn {
            let on_start = opts.on_io_thread_start.clone();
            let on_stop = opts.on_io_thread_stop.clone();
            let join = Builder::new()
                .name("io".to_string())
                .spawn(move || io_loop(shared, on_start, on_stop))?;
            *scheduler.io_thread.lock().unwrap() = Some(join);
        }

        Ok(scheduler)
    }

    /// Creates a scheduler with the default options.
    pub fn with_defaults() -> io::Result<Arc<IoScheduler>> {
        IoScheduler::new(Options::new())
    }

    /// Suspends the awaiter and resumes it on the configured execution side:
    /// the worker pool in throughput mode, the event-loop thread in latency
    /// mode.
    pub fn schedule(&self) -> ScheduleOperation {
        ScheduleOperation {
            shared: self.shared.clone(),
            notify: None,
            counted: false,
        }
    }

    /// Alias for [`IoScheduler::schedule`].
    pub fn yield_now(&self) -> ScheduleOperation {
        self.schedule()
    }

    /// Transfers ownership of a detached task into the scheduler and starts
    /// it. Only `Task<()>` is accepted: a detached task has nowhere to
    /// deliver a result, and its panics are caught and logged.
    pub fn spawn(&self, task: Task<()>) -> Result<(), ScheduleError> {
        if self.shared.is_shut_down() {
            return Err(ScheduleError::ShutDown);
        }

        let guard_target = Arc::downgrade(&self.shared);
        let schedule_target: Weak<dyn Schedule> = Arc::downgrade(&(self.shared.clone() as Arc<dyn Schedule>));
        let first_hop = ScheduleOperation {
            shared: self.shared.clone(),
            notify: None,
            counted: false,
        };

        let handle = self.shared.container.insert(move |index| {
            let guard = CompletionGuard {
                shared: guard_target,
                index,
            };
            let frame = async move {
                let _guard = guard;
                // Hop onto the configured executor before running user code.
                if first_hop.await.is_err() {
                    return;
                }
                task.await;
            };
            let (handle, _join) = spawn_raw(frame, schedule_target, true);
            handle
        });
        handle.schedule();
        Ok(())
    }

    /// Suspends the awaiter for at least `duration`. A zero duration is
    /// equivalent to [`IoScheduler::schedule`].
    pub fn yield_for(&self, duration: Duration) -> TimedWait {
        self.yield_until(Instant::now() + duration)
    }

    /// Suspends the awaiter until at least `deadline`. A past deadline is
    /// equivalent to [`IoScheduler::schedule`].
    pub fn yield_until(&self, deadline: Instant) -> TimedWait {
        TimedWait {
            shared: self.shared.clone(),
            deadline,
            state: TimedState::Init,
            counted: false,
        }
    }

    /// Alias for [`IoScheduler::yield_for`].
    pub fn schedule_after(&self, duration: Duration) -> TimedWait {
        self.yield_for(duration)
    }

    /// Alias for [`IoScheduler::yield_until`].
    pub fn schedule_at(&self, deadline: Instant) -> TimedWait {
        self.yield_until(deadline)
    }

    /// Suspends until `fd` reports readiness for `op`, the timeout expires,
    /// or an error or hang-up is detected; resolves to exactly one
    /// [`PollStatus`].
    pub fn poll(&self, fd: RawFd, op: PollOp, timeout: Option<Duration>) -> PollOperation {
        PollOperation {
            shared: self.shared.clone(),
            fd,
            op,
            timeout,
            state: PollState::Init,
            counted: false,
        }
    }

    /// Directly enqueues a suspended frame's waker on the configured
    /// execution side.
    pub fn resume(&self, waker: Waker) {
        self.shared.route(Work::Wake(waker));
    }

    /// Runs one pass of the event loop on the calling thread (manual thread
    /// strategy), waiting at most `timeout` for events. Returns the number of
    /// tasks executing or waiting to execute.
    pub fn process_events(&self, timeout: Option<Duration>) -> usize {
        self.shared.turn(timeout);
        self.size()
    }

    /// Tasks executing or waiting to execute.
    pub fn size(&self) -> usize {
        let mut size = self.shared.outstanding();
        if let Some(pool) = &self.shared.pool {
            size += pool.size();
        }
        size
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Destroys completed detached tasks and re-uses their slots.
    pub fn garbage_collect(&self) {
        self.shared.container.garbage_collect();
    }

    /// Stops accepting new work, drains everything outstanding (waiting for
    /// in-flight polls to complete or time out), then tears down the pool and
    /// the event-loop thread. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shared
            .shutdown_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("io: shutdown requested");
            let _ = self.shared.waker.wake();

            let mut guard = self.shared.idle_lock.lock().unwrap();
            while self.shared.outstanding() != 0 {
                match self.thread_strategy {
                    ThreadStrategy::Spawn => {
                        let (reacquired, _) = self
                            .shared
                            .idle_cond
                            .wait_timeout(guard, Duration::from_millis(50))
                            .unwrap();
                        guard = reacquired;
                    }
                    ThreadStrategy::Manual => {
                        drop(guard);
                        self.shared.turn(Some(Duration::from_millis(50)));
                        guard = self.shared.idle_lock.lock().unwrap();
                    }
                }
            }
            drop(guard);

            if let Some(pool) = &self.shared.pool {
                pool.shutdown();
            }
            let _ = self.shared.waker.wake();
            let join = self.io_thread.lock().unwrap().take();
            if let Some(join) = join {
                let _ = join.join();
            }
            self.shared.container.garbage_collect();
        } else {
            // Another caller ran the teardown; just wait for the loop thread.
            let join = self.io_thread.lock().unwrap().take();
            if let Some(join) = join {
                let _ = join.join();
            }
        }
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Marks a detached task's container slot for reclamation when its frame is
/// torn down, whether it completed, panicked or was dropped mid-flight.
struct CompletionGuard {
    shared: Weak<Shared>,
    index: usize,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.container.mark_done(self.index);
            shared.notify_idle();
        }
    }
}

/// Awaitable returned by [`IoScheduler::schedule`].
pub struct ScheduleOperation {
    shared: Arc<Shared>,
    notify: Option<Arc<ScheduleNotify>>,
    counted: bool,
}

impl Future for ScheduleOperation {
    type Output = Result<(), ScheduleError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.notify {
            None => {
                if this.shared.is_shut_down() {
                    return Poll::Ready(Err(ScheduleError::ShutDown));
                }
                this.shared.inc_active();
                this.counted = true;
                let notify = Arc::new(ScheduleNotify::new(cx.waker().clone()));
                this.shared.route(Work::Notify(notify.clone()));
                this.notify = Some(notify);
                Poll::Pending
            }
            Some(notify) => {
                if !notify.fired() {
                    notify.set_waker(cx.waker().clone());
                    if !notify.fired() {
                        return Poll::Pending;
                    }
                }
                if this.counted {
                    this.counted = false;
                    this.shared.dec_active();
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for ScheduleOperation {
    fn drop(&mut self) {
        if self.counted {
            self.shared.dec_active();
        }
    }
}

enum TimedState {
    Init,
    /// Degenerate wait (already-expired deadline); plain scheduling hop.
    Sched(Arc<ScheduleNotify>),
    Armed(Arc<PollWait>),
    Finished,
}

/// Awaitable returned by [`IoScheduler::yield_for`] and
/// [`IoScheduler::yield_until`].
pub struct TimedWait {
    shared: Arc<Shared>,
    deadline: Instant,
    state: TimedState,
    counted: bool,
}

impl Future for TimedWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match &this.state {
            TimedState::Init => {
                if this.shared.is_shut_down() {
                    this.state = TimedState::Finished;
                    return Poll::Ready(());
                }
                this.shared.inc_active();
                this.counted = true;

                if this.deadline <= Instant::now() {
                    let notify = Arc::new(ScheduleNotify::new(cx.waker().clone()));
                    this.shared.route(Work::Notify(notify.clone()));
                    this.state = TimedState::Sched(notify);
                    return Poll::Pending;
                }

                let wait = PollWait::new(None, cx.waker().clone());
                {
                    let mut state = wait.state.lock().unwrap();
                    let key = this.shared.insert_timer(this.deadline, wait.clone());
                    state.timer_key = Some(key);
                }
                this.state = TimedState::Armed(wait);
                Poll::Pending
            }
            TimedState::Sched(notify) => {
                if !notify.fired() {
                    notify.set_waker(cx.waker().clone());
                    if !notify.fired() {
                        return Poll::Pending;
                    }
                }
                this.state = TimedState::Finished;
                this.counted = false;
                this.shared.dec_active();
                Poll::Ready(())
            }
            TimedState::Armed(wait) => {
                {
                    let mut state = wait.state.lock().unwrap();
                    if !state.processed {
                        state.waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                }
                this.state = TimedState::Finished;
                this.counted = false;
                this.shared.dec_active();
                Poll::Ready(())
            }
            TimedState::Finished => Poll::Ready(()),
        }
    }
}

impl Drop for TimedWait {
    fn drop(&mut self) {
        if let TimedState::Armed(wait) = &self.state {
            self.shared.cancel_wait(wait);
        }
        if self.counted {
            self.shared.dec_active();
        }
    }
}

enum PollState {
    Init,
    Armed(Arc<PollWait>),
    Finished,
}

/// Awaitable returned by [`IoScheduler::poll`].
pub struct PollOperation {
    shared: Arc<Shared>,
    fd: RawFd,
    op: PollOp,
    timeout: Option<Duration>,
    state: PollState,
    counted: bool,
}

impl Future for PollOperation {
    type Output = PollStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<PollStatus> {
        let this = self.get_mut();
        match &this.state {
            PollState::Init => {
                if this.shared.is_shut_down() {
                    this.state = PollState::Finished;
                    return Poll::Ready(PollStatus::Error);
                }
                this.shared.inc_active();
                this.counted = true;

                let wait = PollWait::new(Some(this.fd), cx.waker().clone());
                {
                    let mut state = wait.state.lock().unwrap();
                    if let Some(timeout) = this.timeout {
                        if !timeout.is_zero() {
                            let deadline = Instant::now() + timeout;
                            let key = this.shared.insert_timer(deadline, wait.clone());
                            state.timer_key = Some(key);
                        }
                    }
                    match this.shared.register_fd(this.fd, this.op, wait.clone()) {
                        Ok(token) => state.token = Some(token),
                        Err(err) => {
                            warn!("io: fd {} registration failed: {}", this.fd, err);
                            if let Some(key) = state.timer_key.take() {
                                this.shared.timed.lock().unwrap().remove(&key);
                            }
                            drop(state);
                            this.state = PollState::Finished;
                            this.counted = false;
                            this.shared.dec_active();
                            return Poll::Ready(PollStatus::Error);
                        }
                    }
                }
                this.state = PollState::Armed(wait);
                Poll::Pending
            }
            PollState::Armed(wait) => {
                let status = {
                    let mut state = wait.state.lock().unwrap();
                    if !state.processed {
                        state.waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                    state.status.unwrap_or(PollStatus::Error)
                };
                this.state = PollState::Finished;
                this.counted = false;
                this.shared.dec_active();
                Poll::Ready(status)
            }
            PollState::Finished => Poll::Ready(PollStatus::Error),
        }
    }
}

impl Drop for PollOperation {
    fn drop(&mut self) {
        if let PollState::Armed(wait) = &self.state {
            self.shared.cancel_wait(wait);
        }
        if self.counted {
            self.shared.dec_active();
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use super::{ExecutionStrategy, IoScheduler, Options, ThreadStrategy};
    use crate::error::ScheduleError;
    use crate::poll::{PollOp, PollStatus};
    use crate::sync_wait::sync_wait;
    use crate::task::Task;
    use crate::when_all::when_all;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(res, 0, "pipe(2) failed");
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn write_byte(fd: RawFd) {
        let byte = [1u8];
        let written = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(written, 1);
    }

    #[test]
    fn yield_for_resumes_after_the_duration() {
        let scheduler = IoScheduler::with_defaults().unwrap();

        let start = Instant::now();
        sync_wait(scheduler.yield_for(Duration::from_millis(50)));
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(45), "woke early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "woke far too late: {:?}", elapsed);

        scheduler.shutdown();
        assert_eq!(scheduler.size(), 0);
    }

    #[test]
    fn yield_until_a_past_deadline_is_a_plain_yield() {
        let scheduler = IoScheduler::with_defaults().unwrap();
        sync_wait(scheduler.yield_until(Instant::now() - Duration::from_millis(5)));
        sync_wait(scheduler.schedule_after(Duration::ZERO));
        scheduler.shutdown();
    }

    #[test]
    fn poll_event_beats_the_timeout() {
        let scheduler = IoScheduler::with_defaults().unwrap();
        let (read_fd, write_fd) = pipe();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            write_byte(write_fd);
        });

        let start = Instant::now();
        let status = sync_wait(scheduler.poll(read_fd, PollOp::Read, Some(Duration::from_secs(5))));
        let elapsed = start.elapsed();

        assert_eq!(status, PollStatus::Event);
        assert!(elapsed < Duration::from_secs(1), "event was late: {:?}", elapsed);

        // The losing timer entry was withdrawn with the delivery.
        assert_eq!(scheduler.shared.timed.lock().unwrap().len(), 0);
        assert_eq!(scheduler.shared.waits.lock().unwrap().len(), 0);

        writer.join().unwrap();
        scheduler.shutdown();
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn poll_times_out_on_a_silent_descriptor() {
        let scheduler = IoScheduler::with_defaults().unwrap();
        let (read_fd, write_fd) = pipe();

        let start = Instant::now();
        let status = sync_wait(scheduler.poll(read_fd, PollOp::Read, Some(Duration::from_millis(20))));
        let elapsed = start.elapsed();

        assert_eq!(status, PollStatus::Timeout);
        assert!(elapsed >= Duration::from_millis(15), "timed out early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "timed out late: {:?}", elapsed);

        // The fd subscription was removed along with the timeout delivery.
        assert_eq!(scheduler.shared.waits.lock().unwrap().len(), 0);

        scheduler.shutdown();
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn dropping_a_pending_poll_releases_both_subscriptions() {
        let scheduler = IoScheduler::with_defaults().unwrap();
        let (read_fd, write_fd) = pipe();

        {
            let mut operation = Box::pin(scheduler.poll(
                read_fd,
                PollOp::Read,
                Some(Duration::from_secs(30)),
            ));
            let waker = std::task::Waker::noop();
            let mut cx = std::task::Context::from_waker(waker);
            assert!(std::future::Future::poll(operation.as_mut(), &mut cx).is_pending());
            assert_eq!(scheduler.shared.waits.lock().unwrap().len(), 1);
            assert_eq!(scheduler.shared.timed.lock().unwrap().len(), 1);
        }

        assert_eq!(scheduler.shared.waits.lock().unwrap().len(), 0);
        assert_eq!(scheduler.shared.timed.lock().unwrap().len(), 0);
        assert_eq!(scheduler.size(), 0);

        scheduler.shutdown();
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn when_all_of_mixed_timers_completes_after_the_longest() {
        let scheduler = IoScheduler::with_defaults().unwrap();

        let start = Instant::now();
        sync_wait(when_all((
            scheduler.yield_for(Duration::from_millis(10)),
            scheduler.yield_for(Duration::from_millis(50)),
            scheduler.yield_for(Duration::from_millis(100)),
        )));
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(100), "woke early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2000), "woke late: {:?}", elapsed);

        assert_eq!(scheduler.size(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_flushes_detached_tasks() {
        let _ = env_logger::builder().is_test(true).try_init();
        let scheduler = IoScheduler::with_defaults().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            scheduler
                .spawn(Task::new(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        scheduler.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert!(scheduler.empty());

        assert_eq!(
            scheduler.spawn(Task::new(async {})),
            Err(ScheduleError::ShutDown)
        );
    }

    #[test]
    fn garbage_collect_reclaims_completed_slots() {
        let scheduler = IoScheduler::with_defaults().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = counter.clone();
            scheduler
                .spawn(Task::new(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        // Slot reclamation lags the counter bump by one teardown step, so
        // collect until every slot is back on the free list.
        let start = Instant::now();
        loop {
            scheduler.garbage_collect();
            if scheduler.shared.container.occupied() == 0 {
                break;
            }
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "slots were never reclaimed"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);

        scheduler.shutdown();
    }

    #[test]
    fn inline_mode_resumes_in_append_order() {
        let scheduler = IoScheduler::new(
            Options::new().execution_strategy(ExecutionStrategy::Inline),
        )
        .unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..5u32 {
            let order = order.clone();
            scheduler
                .spawn(Task::new(async move {
                    order.lock().unwrap().push(id);
                }))
                .unwrap();
        }

        scheduler.shutdown();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn inline_schedule_resumes_on_the_io_thread() {
        let scheduler = IoScheduler::new(
            Options::new().execution_strategy(ExecutionStrategy::Inline),
        )
        .unwrap();
        let thread_name = Arc::new(Mutex::new(String::new()));

        {
            let thread_name = thread_name.clone();
            scheduler
                .spawn(Task::new(async move {
                    let name = std::thread::current().name().unwrap_or("").to_string();
                    *thread_name.lock().unwrap() = name;
                }))
                .unwrap();
        }

        scheduler.shutdown();
        assert_eq!(*thread_name.lock().unwrap(), "io");
    }

    #[test]
    fn manual_strategy_is_driven_by_process_events() {
        let scheduler = IoScheduler::new(
            Options::new()
                .thread_strategy(ThreadStrategy::Manual)
                .execution_strategy(ExecutionStrategy::Inline),
        )
        .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let counter = counter.clone();
            scheduler
                .spawn(Task::new(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        while counter.load(Ordering::SeqCst) == 0 {
            scheduler.process_events(Some(Duration::from_millis(10)));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
    }

    #[test]
    fn manual_strategy_delivers_timers() {
        let scheduler = IoScheduler::new(
            Options::new()
                .thread_strategy(ThreadStrategy::Manual)
                .execution_strategy(ExecutionStrategy::Inline),
        )
        .unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        {
            let done = done.clone();
            let timer = scheduler.yield_for(Duration::from_millis(20));
            scheduler
                .spawn(Task::new(async move {
                    timer.await;
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        let start = Instant::now();
        while done.load(Ordering::SeqCst) == 0 {
            scheduler.process_events(Some(Duration::from_millis(10)));
            assert!(start.elapsed() < Duration::from_secs(5), "timer never fired");
        }

        scheduler.shutdown();
    }

    #[test]
    fn io_thread_hooks_run() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let scheduler = {
            let started = started.clone();
            let stopped = stopped.clone();
            IoScheduler::new(
                Options::new()
                    .on_io_thread_start(move || {
                        started.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_io_thread_stop(move || {
                        stopped.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap()
        };

        scheduler.shutdown();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_hops_through_the_pool() {
        let scheduler = IoScheduler::with_defaults().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        {
            let done = done.clone();
            let hop = scheduler.schedule();
            scheduler
                .spawn(Task::new(async move {
                    hop.await.unwrap();
                    let name = std::thread::current().name().unwrap_or("").to_string();
                    assert!(name.starts_with("worker#"), "resumed on {:?}", name);
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        scheduler.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
