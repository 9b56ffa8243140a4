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

//! Blocking bridge between coroutine and non-coroutine code
//!
//! [`sync_wait`] drives any awaitable to completion from a plain thread: the
//! frame is pinned on the caller's stack and polled against a waker backed by
//! a mutex/condvar pair, blocking the thread between suspensions. No executor
//! is involved; whatever the awaitable suspends on (an I/O scheduler, a thread
//! pool, a synchronization primitive) resumes the caller through the waker.

use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};

/// One-shot completion signal shared between the blocked caller and whichever
/// thread completes the awaitable.
struct SyncWaitEvent {
    set: Mutex<bool>,
    cond: Condvar,
}

impl SyncWaitEvent {
    fn new() -> SyncWaitEvent {
        SyncWaitEvent {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut set = self.set.lock().unwrap();
        *set = true;
        self.cond.notify_one();
    }

    /// Blocks until the event is set, then clears it for the next suspension.
    fn wait(&self) {
        let mut set = self.set.lock().unwrap();
        while !*set {
            set = self.cond.wait(set).unwrap();
        }
        *set = false;
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

/// Runs an awaitable to completion on the calling thread and returns its
/// result.
///
/// The result is returned by value straight out of the final resumption, so
/// it is moved before the frame is torn down.
pub fn sync_wait<F: Future>(awaitable: F) -> F::Output {
    let mut frame = pin!(awaitable);
    let event = Arc::new(SyncWaitEvent::new());
    let waker = Waker::from(event.clone());
    let mut cx = Context::from_waker(&waker);

    loop {
        match frame.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => event.wait(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::sync_wait;
    use crate::runtime::thread_pool::ThreadPool;

    #[test]
    fn ready_awaitable_returns_immediately() {
        assert_eq!(sync_wait(async { 5u32 }), 5);
    }

    #[test]
    fn scheduled_computation_runs_on_a_worker() {
        let pool = ThreadPool::default();

        let join = pool
            .spawn_fn(|| {
                let name = std::thread::current().name().unwrap_or("").to_string();
                (42u32, name)
            })
            .unwrap();

        let (value, thread_name) = sync_wait(join);
        assert_eq!(value, 42);
        assert!(thread_name.starts_with("worker#"));

        pool.shutdown();
    }

    #[test]
    fn waits_across_a_real_suspension() {
        let pool = ThreadPool::default();
        let join = pool
            .spawn_fn(|| {
                std::thread::sleep(Duration::from_millis(20));
                "done"
            })
            .unwrap();
        assert_eq!(sync_wait(join), "done");
        pool.shutdown();
    }
}
