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

//! Executor-owned coroutine frames
//!
//! A [`Coroutine`] couples a heap-pinned frame with the executor it belongs
//! to. Its waker re-enqueues the frame on that executor, so a resumption
//! always runs where the frame was spawned, no matter which thread triggered
//! the wake. A small state machine collapses concurrent wakes into a single
//! queued resumption.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;

use log::{error, trace};

/// An executor target that coroutine frames can be (re-)enqueued on.
pub(crate) trait Schedule: Send + Sync {
    fn schedule(&self, handle: Handle);
}

/// Object-safe surface of a spawned coroutine frame.
pub(crate) trait Resumable: Send + Sync {
    /// Polls the frame once on the calling thread.
    fn resume(self: Arc<Self>);
    /// Enqueues the frame on its owning executor, deduplicating with any
    /// resumption already in flight.
    fn schedule(self: Arc<Self>);
    fn is_finished(&self) -> bool;
}

/// A shared reference to a spawned coroutine frame.
pub(crate) type Handle = Arc<dyn Resumable>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Status {
    /// Suspended and not queued anywhere; a wake must enqueue it.
    Idle,
    /// Sitting in an executor queue awaiting resumption.
    Scheduled,
    /// Being polled right now.
    Running,
    /// Woken while running; re-enqueue once the poll returns.
    Notified,
    /// Ran to completion (or unwound); the frame is gone.
    Done,
}

struct Frame<F: Future> {
    fut: Option<Pin<Box<F>>>,
    status: Status,
}

/// A spawned coroutine frame owned by an executor.
pub(crate) struct Coroutine<F: Future> {
    frame: Mutex<Frame<F>>,
    target: Weak<dyn Schedule>,
    result: Arc<ResultCell<F::Output>>,
    /// Detached frames have no joiner; their panics are logged instead of
    /// being stored for rethrow.
    detached: bool,
}

impl<F> Coroutine<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn enqueue(self: Arc<Self>) {
        let mut frame = self.frame.lock().unwrap();
        match frame.status {
            Status::Idle => {
                frame.status = Status::Scheduled;
                drop(frame);
                match self.target.upgrade() {
                    Some(target) => target.schedule(self),
                    None => {
                        trace!("coroutine woken after its executor was dropped");
                        self.frame.lock().unwrap().status = Status::Idle;
                    }
                }
            }
            Status::Running => frame.status = Status::Notified,
            Status::Scheduled | Status::Notified | Status::Done => {}
        }
    }
}

impl<F> Wake for Coroutine<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.enqueue();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().enqueue();
    }
}

impl<F> Resumable for Coroutine<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn resume(self: Arc<Self>) {
        let mut fut = {
            let mut frame = self.frame.lock().unwrap();
            if frame.status == Status::Done {
                return;
            }
            frame.status = Status::Running;
            match frame.fut.take() {
                Some(fut) => fut,
                None => return,
            }
        };

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)));

        match polled {
            Ok(Poll::Pending) => {
                let mut frame = self.frame.lock().unwrap();
                frame.fut = Some(fut);
                if frame.status == Status::Notified {
                    frame.status = Status::Scheduled;
                    drop(frame);
                    if let Some(target) = self.target.upgrade() {
                        target.schedule(self);
                    }
                } else {
                    frame.status = Status::Idle;
                }
            }
            Ok(Poll::Ready(value)) => {
                self.frame.lock().unwrap().status = Status::Done;
                // Run the frame's destructors before publishing completion.
                drop(fut);
                self.result.complete(Ok(value));
            }
            Err(payload) => {
                self.frame.lock().unwrap().status = Status::Done;
                drop(fut);
                if self.detached {
                    error!("detached task panicked: {}", panic_message(&payload));
                } else {
                    self.result.complete(Err(payload));
                }
            }
        }
    }

    fn schedule(self: Arc<Self>) {
        self.enqueue();
    }

    fn is_finished(&self) -> bool {
        self.frame.lock().unwrap().status == Status::Done
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

struct JoinState<T> {
    result: Option<thread::Result<T>>,
    waker: Option<Waker>,
}

/// Completion slot shared between a coroutine and its join handle.
pub(crate) struct ResultCell<T> {
    inner: Mutex<JoinState<T>>,
}

impl<T> ResultCell<T> {
    fn new() -> ResultCell<T> {
        ResultCell {
            inner: Mutex::new(JoinState {
                result: None,
                waker: None,
            }),
        }
    }

    fn complete(&self, result: thread::Result<T>) {
        let waker = {
            let mut state = self.inner.lock().unwrap();
            state.result = Some(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// An awaitable handle to the result of a spawned coroutine.
///
/// Dropping the handle detaches the coroutine; it keeps running on its
/// executor and its result is discarded. Awaiting a coroutine that panicked
/// resumes the unwind on the joiner.
pub struct JoinHandle<T> {
    cell: Arc<ResultCell<T>>,
}

impl<T> JoinHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.cell.inner.lock().unwrap().result.is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.cell.inner.lock().unwrap();
        match state.result.take() {
            Some(Ok(value)) => Poll::Ready(value),
            Some(Err(payload)) => {
                drop(state);
                panic::resume_unwind(payload)
            }
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Allocates a coroutine frame bound to `target`. The frame is not enqueued;
/// the caller starts it with [`Resumable::schedule`].
pub(crate) fn spawn_raw<F>(
    fut: F,
    target: Weak<dyn Schedule>,
    detached: bool,
) -> (Handle, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let cell = Arc::new(ResultCell::new());
    let coroutine = Arc::new(Coroutine {
        frame: Mutex::new(Frame {
            fut: Some(Box::pin(fut)),
            status: Status::Idle,
        }),
        target,
        result: cell.clone(),
        detached,
    });
    let handle: Handle = coroutine;
    (handle, JoinHandle { cell })
}
