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

//! Bounded-worker FIFO executor
//!
//! The pool resumes coroutine frames on a fixed set of worker threads. Work
//! handed in from one thread is resumed in hand-in order; across threads the
//! only guarantee is that every accepted unit is resumed exactly once. After
//! [`ThreadPool::shutdown`] the workers drain everything already accepted and
//! then exit; new work is rejected.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::thread::{self, Builder};

use log::trace;

use super::coroutine::{spawn_raw, Handle, JoinHandle, Schedule};
use super::{ScheduleNotify, Work};
use crate::error::ScheduleError;

/// Hook invoked on a worker thread as it starts or stops; receives the worker
/// index.
pub type ThreadHook = Arc<dyn Fn(usize) + Send + Sync + 'static>;

/// Thread pool configuration.
#[derive(Clone)]
pub struct Options {
    thread_count: usize,
    on_thread_start: Option<ThreadHook>,
    on_thread_stop: Option<ThreadHook>,
}

impl Options {
    pub fn new() -> Options {
        Options {
            thread_count: num_cpus::get(),
            on_thread_start: None,
            on_thread_stop: None,
        }
    }

    /// Set the number of worker threads.
    ///
    /// Default is equal to the number of CPUs in the system.
    pub fn thread_count(mut self, count: usize) -> Options {
        self.thread_count = count.max(1);
        self
    }

    /// Set a callback to run on each worker thread as it starts.
    pub fn on_thread_start<F>(mut self, f: F) -> Options
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Set a callback to run on each worker thread before it exits.
    pub fn on_thread_stop<F>(mut self, f: F) -> Options
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_thread_stop = Some(Arc::new(f));
        self
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}

pub(crate) struct PoolShared {
    queue: Mutex<VecDeque<Work>>,
    condvar: Condvar,
    /// Units accepted but not yet fully resumed: queue length plus work
    /// currently held by workers.
    size: AtomicUsize,
    shutdown: AtomicBool,
    thread_count: usize,
}

impl PoolShared {
    pub(crate) fn push(&self, work: Work) {
        self.size.fetch_add(1, Ordering::AcqRel);
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(work);
        }
        self.condvar.notify_one();
    }

    fn push_bulk(&self, bulk: Vec<Work>) {
        let count = bulk.len();
        if count == 0 {
            return;
        }
        self.size.fetch_add(count, Ordering::AcqRel);
        {
            let mut queue = self.queue.lock().unwrap();
            queue.extend(bulk);
        }
        if count >= self.thread_count {
            self.condvar.notify_all();
        } else {
            for _ in 0..count {
                self.condvar.notify_one();
            }
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Schedule for PoolShared {
    fn schedule(&self, handle: Handle) {
        self.push(Work::Run(handle));
    }
}

/// FIFO executor over a bounded set of worker threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Default for ThreadPool {
    fn default() -> ThreadPool {
        ThreadPool::new(Options::new())
    }
}

impl ThreadPool {
    pub fn new(opts: Options) -> ThreadPool {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            size: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            thread_count: opts.thread_count,
        });

        let mut workers = Vec::with_capacity(opts.thread_count);
        for worker_id in 0..opts.thread_count {
            let shared = shared.clone();
            let on_start = opts.on_thread_start.clone();
            let on_stop = opts.on_thread_stop.clone();
            let join = Builder::new()
                .name(format!("worker#{}", worker_id))
                .spawn(move || worker_loop(worker_id, shared, on_start, on_stop))
                .unwrap_or_else(|err| panic!("couldn't spawn worker thread: {}", err));
            workers.push(join);
        }

        ThreadPool {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Suspends the awaiter and re-enqueues it at the tail of the run queue;
    /// the resumption is serviced by a worker.
    ///
    /// Resolves to an error if the pool has been shut down.
    pub fn schedule(&self) -> ScheduleOperation {
        ScheduleOperation {
            shared: self.shared.clone(),
            notify: None,
        }
    }

    /// Alias for [`ThreadPool::schedule`]: give other queued work a turn.
    pub fn yield_now(&self) -> ScheduleOperation {
        self.schedule()
    }

    /// Spawns a coroutine frame owned and executed by this pool, returning an
    /// awaitable handle to its result.
    pub fn spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>, ScheduleError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.shared.is_shut_down() {
            return Err(ScheduleError::ShutDown);
        }
        let target: Weak<dyn Schedule> = Arc::downgrade(&(self.shared.clone() as Arc<dyn Schedule>));
        let (handle, join) = spawn_raw(fut, target, false);
        handle.schedule();
        Ok(join)
    }

    /// Runs a plain closure on a worker thread; the convenience form of
    /// [`ThreadPool::spawn`].
    pub fn spawn_fn<F, R>(&self, f: F) -> Result<JoinHandle<R>, ScheduleError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.spawn(async move { f() })
    }

    /// Directly enqueues a suspended frame's waker; a worker will resume it.
    pub fn resume(&self, waker: Waker) {
        self.shared.push(Work::Wake(waker));
    }

    /// Bulk variant of [`ThreadPool::resume`]. All workers are notified when
    /// the batch is at least as large as the pool.
    pub fn resume_all<I>(&self, wakers: I)
    where
        I: IntoIterator<Item = Waker>,
    {
        let bulk: Vec<Work> = wakers.into_iter().map(Work::Wake).collect();
        self.shared.push_bulk(bulk);
    }

    /// Units accepted but not yet fully resumed.
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }

    /// Units currently sitting in the queue.
    pub fn queue_size(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Stops accepting new work, drains everything already accepted and joins
    /// the workers. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shared
            .shutdown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("thread pool: shutdown requested");
            self.shared.condvar.notify_all();
        }

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for join in workers {
            let _ = join.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    shared: Arc<PoolShared>,
    on_start: Option<ThreadHook>,
    on_stop: Option<ThreadHook>,
) {
    if let Some(hook) = &on_start {
        hook(worker_id);
    }
    trace!("worker#{}: starts", worker_id);

    loop {
        let work = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(work) = queue.pop_front() {
                    break Some(work);
                }
                if shared.is_shut_down() {
                    break None;
                }
                queue = shared.condvar.wait(queue).unwrap();
            }
        };

        let Some(work) = work else {
            break;
        };
        work.complete();
        shared.size.fetch_sub(1, Ordering::AcqRel);
    }

    trace!("worker#{}: is shutdown", worker_id);
    if let Some(hook) = &on_stop {
        hook(worker_id);
    }
}

/// Awaitable returned by [`ThreadPool::schedule`] and the scheduling
/// operations of the I/O scheduler.
pub struct ScheduleOperation {
    shared: Arc<PoolShared>,
    notify: Option<Arc<ScheduleNotify>>,
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
                let notify = Arc::new(ScheduleNotify::new(cx.waker().clone()));
                this.shared.push(Work::Notify(notify.clone()));
                this.notify = Some(notify);
                Poll::Pending
            }
            Some(notify) => {
                if notify.fired() {
                    return Poll::Ready(Ok(()));
                }
                notify.set_waker(cx.waker().clone());
                if notify.fired() {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{Options, ThreadPool};
    use crate::error::ScheduleError;
    use crate::sync_wait::sync_wait;

    // Frames spawned from a single thread must be resumed in spawn order.
    #[test]
    fn single_producer_fifo_order() {
        let pool = ThreadPool::new(Options::new().thread_count(1));
        let results = Arc::new(Mutex::new(Vec::with_capacity(5)));

        for i in 1..4 {
            let results = results.clone();
            pool.spawn(async move {
                results.lock().unwrap().push(i);
            })
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(*results.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn yield_requeues_at_the_tail() {
        let pool = Arc::new(ThreadPool::new(Options::new().thread_count(1)));
        let results = Arc::new(Mutex::new(Vec::new()));

        // Hold the single worker on a barrier until both tasks are queued, so
        // the queue order is fixed before anything runs.
        let gate = Arc::new(std::sync::Barrier::new(2));
        {
            let gate = gate.clone();
            pool.spawn(async move {
                gate.wait();
            })
            .unwrap();
        }

        {
            let pool = pool.clone();
            let results = results.clone();
            pool.clone()
                .spawn(async move {
                    results.lock().unwrap().push("first:a");
                    pool.yield_now().await.unwrap();
                    results.lock().unwrap().push("first:b");
                })
                .unwrap();
        }
        {
            let results = results.clone();
            pool.spawn(async move {
                results.lock().unwrap().push("second");
            })
            .unwrap();
        }

        gate.wait();
        pool.shutdown();
        assert_eq!(
            *results.lock().unwrap(),
            vec!["first:a", "second", "first:b"]
        );
    }

    #[test]
    fn shutdown_flushes_accepted_work() {
        let pool = ThreadPool::default();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let counter = counter.clone();
            pool.spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert!(pool.empty());

        // New work is rejected once the pool is down.
        assert_eq!(
            pool.spawn(async {}).map(drop).unwrap_err(),
            ScheduleError::ShutDown
        );
    }

    #[test]
    fn schedule_fails_after_shutdown() {
        let pool = ThreadPool::new(Options::new().thread_count(2));
        pool.shutdown();
        assert_eq!(sync_wait(pool.schedule()), Err(ScheduleError::ShutDown));
    }

    #[test]
    fn join_handle_returns_the_value() {
        let pool = ThreadPool::default();
        let join = pool.spawn(async { 2 + 3 }).unwrap();
        assert_eq!(sync_wait(join), 5);
        pool.shutdown();
    }

    #[test]
    fn join_handle_rethrows_a_panic() {
        let pool = ThreadPool::new(Options::new().thread_count(1));
        let join = pool
            .spawn(async {
                panic!("worker task failed");
            })
            .unwrap();

        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sync_wait(join)));
        assert!(err.is_err());
        pool.shutdown();
    }

    #[test]
    fn thread_hooks_run_once_per_worker() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let pool = {
            let started = started.clone();
            let stopped = stopped.clone();
            ThreadPool::new(
                Options::new()
                    .thread_count(3)
                    .on_thread_start(move |_| {
                        started.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_thread_stop(move |_| {
                        stopped.fetch_add(1, Ordering::SeqCst);
                    }),
            )
        };

        pool.shutdown();
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn resume_services_a_foreign_waker() {
        let pool = ThreadPool::new(Options::new().thread_count(1));

        let value = sync_wait(async {
            let mut handed_off = false;
            std::future::poll_fn(|cx| {
                if handed_off {
                    std::task::Poll::Ready(17u32)
                } else {
                    handed_off = true;
                    pool.resume(cx.waker().clone());
                    std::task::Poll::Pending
                }
            })
            .await
        });

        assert_eq!(value, 17);
        pool.shutdown();
    }
}
