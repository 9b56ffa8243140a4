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

//! # Corio
//!
//! Coroutine task scheduler with non-blocking I/O support.
//!
//! Corio multiplexes stackless coroutines (plain Rust futures) over an OS
//! readiness facility and a bounded worker pool, with a small set of
//! synchronization primitives designed for use from within suspendable tasks.
//!
//! ```norust
//! * lazy, move-only tasks (see `Task`);
//! * pull-driven generators (see `Generator`);
//! * a blocking bridge for non-coroutine callers (see `sync_wait()`);
//! * an all-of combinator (see `when_all()`);
//! * a FIFO worker pool (see `ThreadPool`);
//! * an event/latch/shared-mutex trio (see the `sync` module);
//! * an epoll/kqueue-backed I/O scheduler with timers (see `IoScheduler`).
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use corio::{sync_wait, IoScheduler, PollOp, Task};
//!
//! let scheduler = IoScheduler::with_defaults().unwrap();
//!
//! // Fire-and-forget work owned by the scheduler.
//! scheduler
//!     .spawn(Task::new(async { /* ... */ }))
//!     .unwrap();
//!
//! // Timed and I/O waits from any coroutine, driven to completion here.
//! sync_wait(async {
//!     scheduler.yield_for(Duration::from_millis(10)).await;
//!     let status = scheduler.poll(0, PollOp::Read, Some(Duration::from_secs(1))).await;
//!     let _ = status;
//! });
//!
//! scheduler.shutdown();
//! ```

pub mod error;
pub mod generator;
pub mod poll;
pub mod runtime;
pub mod sync;
pub mod sync_wait;
pub mod task;
pub mod when_all;

pub use crate::error::ScheduleError;
pub use crate::generator::{Generator, Yielder};
pub use crate::poll::{PollOp, PollStatus};
pub use crate::runtime::io_scheduler::{ExecutionStrategy, IoScheduler, ThreadStrategy};
pub use crate::runtime::thread_pool::ThreadPool;
pub use crate::runtime::JoinHandle;
pub use crate::sync::{Event, Latch, ResumeOrderPolicy, SharedMutex, SharedScopedLock};
pub use crate::sync_wait::sync_wait;
pub use crate::task::Task;
pub use crate::when_all::when_all;
