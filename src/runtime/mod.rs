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

//! Executors: the worker thread pool and the I/O event scheduler

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

pub mod io_scheduler;
pub mod thread_pool;

pub(crate) mod coroutine;
mod task_container;

pub use self::coroutine::JoinHandle;
pub use self::io_scheduler::IoScheduler;
pub use self::thread_pool::ThreadPool;

use self::coroutine::Handle;

/// A unit of work handed to an executor.
///
/// `Run` resumes an executor-owned coroutine frame on the executing thread;
/// `Wake` and `Notify` hand control back to a frame suspended elsewhere, which
/// then resumes wherever its own executor runs it.
pub(crate) enum Work {
    Run(Handle),
    Wake(Waker),
    Notify(Arc<ScheduleNotify>),
}

impl Work {
    pub(crate) fn complete(self) {
        match self {
            Work::Run(handle) => handle.resume(),
            Work::Wake(waker) => waker.wake(),
            Work::Notify(notify) => notify.fire(),
        }
    }
}

/// Completion flag shared between a schedule awaitable and the executor that
/// eventually services it. The flag distinguishes a real service from a
/// spurious re-poll of the awaitable.
pub(crate) struct ScheduleNotify {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl ScheduleNotify {
    pub(crate) fn new(waker: Waker) -> ScheduleNotify {
        ScheduleNotify {
            fired: AtomicBool::new(false),
            waker: Mutex::new(Some(waker)),
        }
    }

    /// Marks the notification serviced and resumes the suspended frame.
    pub(crate) fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        let waker = self.waker.lock().unwrap().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) fn set_waker(&self, waker: Waker) {
        *self.waker.lock().unwrap() = Some(waker);
    }
}
