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

//! Readiness interests and results for [`IoScheduler::poll`](crate::IoScheduler::poll)

use mio::Interest;

/// The readiness operations a file descriptor can be polled for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollOp {
    /// Poll for the descriptor becoming readable.
    Read,
    /// Poll for the descriptor becoming writable.
    Write,
    /// Poll for the descriptor becoming readable or writable.
    ReadWrite,
}

impl PollOp {
    pub(crate) fn interest(self) -> Interest {
        match self {
            PollOp::Read => Interest::READABLE,
            PollOp::Write => Interest::WRITABLE,
            PollOp::ReadWrite => Interest::READABLE | Interest::WRITABLE,
        }
    }

    /// Does this operation include read interest?
    pub fn has_read(self) -> bool {
        matches!(self, PollOp::Read | PollOp::ReadWrite)
    }

    /// Does this operation include write interest?
    pub fn has_write(self) -> bool {
        matches!(self, PollOp::Write | PollOp::ReadWrite)
    }
}

/// The outcome of a single poll operation.
///
/// Exactly one status is ever delivered per wait; whichever of the readiness
/// event, the timeout or a detected error/hang-up arrives first wins and the
/// other notification is suppressed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollStatus {
    /// One of the requested operations became ready.
    Event,
    /// The wait expired before any of the requested operations became ready.
    Timeout,
    /// The descriptor reported an error condition.
    Error,
    /// The peer hung up and no further readiness will be reported.
    Closed,
}

impl PollStatus {
    /// Shorthand for `self == PollStatus::Event`.
    pub fn is_event(self) -> bool {
        self == PollStatus::Event
    }
}

/// Classify an OS readiness event into a poll status.
///
/// A hang-up that still carries readable or writable bits is reported as an
/// event so the caller can drain buffered data before observing EOF itself.
pub(crate) fn classify(event: &mio::event::Event) -> PollStatus {
    if event.is_error() {
        PollStatus::Error
    } else if (event.is_read_closed() || event.is_write_closed())
        && !event.is_readable()
        && !event.is_writable()
    {
        PollStatus::Closed
    } else {
        PollStatus::Event
    }
}
