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

//! Lazy coroutine task
//!
//! A [`Task`] owns a heap-pinned coroutine frame that produces a single value.
//! Nothing runs until the task is awaited or stepped with [`Task::resume`]; the
//! frame is destroyed together with the task value. Awaiting a task polls the
//! frame inline on the awaiter's stack, so deep `await` chains neither hop
//! executors nor grow the stack per link.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

enum State<T> {
    /// The frame has not completed yet.
    Polling(Pin<Box<dyn Future<Output = T> + Send + 'static>>),
    /// The frame completed via `resume()` and the value waits for a consumer.
    Ready(T),
    /// The value has been handed out; the task holds nothing.
    Consumed,
}

/// A handle to an at-most-once execution of a coroutine producing `T`.
///
/// `Task` is move-only. A task may be awaited by at most one awaiter at a
/// time; once the result has been consumed, awaiting again is a programmer
/// error and panics.
pub struct Task<T> {
    state: State<T>,
}

// The task never treats `T` as structurally pinned; the frame itself is
// separately pinned on the heap.
impl<T> Unpin for Task<T> {}

impl<T: Send + 'static> Task<T> {
    /// Wraps a coroutine frame. The frame is started lazily: it only runs
    /// once the task is awaited or `resume()`d.
    pub fn new<F>(fut: F) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        Task {
            state: State::Polling(Box::pin(fut)),
        }
    }
}

impl<T> Task<T> {
    /// Has the frame run to completion?
    pub fn is_ready(&self) -> bool {
        !matches!(self.state, State::Polling(_))
    }

    /// Steps the frame once without an executor. Returns whether the task is
    /// complete afterwards.
    ///
    /// A frame suspended on an external notification (an event, a poll, ...)
    /// is not re-stepped automatically; `resume()` is the manual drive used by
    /// code that knows the frame can make progress.
    pub fn resume(&mut self) -> bool {
        match &mut self.state {
            State::Polling(fut) => {
                let mut cx = Context::from_waker(Waker::noop());
                match fut.as_mut().poll(&mut cx) {
                    Poll::Ready(value) => {
                        self.state = State::Ready(value);
                        true
                    }
                    Poll::Pending => false,
                }
            }
            _ => true,
        }
    }
}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match mem::replace(&mut this.state, State::Consumed) {
            State::Polling(mut fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(value) => Poll::Ready(value),
                Poll::Pending => {
                    this.state = State::Polling(fut);
                    Poll::Pending
                }
            },
            State::Ready(value) => Poll::Ready(value),
            State::Consumed => panic!("task result was never set"),
        }
    }
}
