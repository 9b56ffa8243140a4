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

//! Fair reader/writer mutex for coroutines
//!
//! Waiters queue in strict FIFO arrival order. A queued exclusive waiter gates
//! all new shared acquisitions, so writers cannot starve behind a stream of
//! readers. On release, a head-of-queue writer is granted alone; a head run of
//! readers is granted as one batch, each resuming through its own waker in
//! parallel.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum LockState {
    Unlocked,
    Shared,
    Exclusive,
}

struct WaiterState {
    granted: bool,
    waker: Option<Waker>,
}

struct LockWaiter {
    exclusive: bool,
    state: Mutex<WaiterState>,
}

struct Inner {
    state: LockState,
    shared_users: usize,
    exclusive_waiters: usize,
    waiters: VecDeque<Arc<LockWaiter>>,
}

/// A reader/writer mutex whose lock operations are awaitables resolving to an
/// RAII guard.
///
/// The mutex guards no payload of its own; it sequences access to external
/// state, exactly like its exclusive counterpart in a threaded program.
pub struct SharedMutex {
    inner: Mutex<Inner>,
}

impl Default for SharedMutex {
    fn default() -> SharedMutex {
        SharedMutex::new()
    }
}

impl SharedMutex {
    pub fn new() -> SharedMutex {
        SharedMutex {
            inner: Mutex::new(Inner {
                state: LockState::Unlocked,
                shared_users: 0,
                exclusive_waiters: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquires the mutex exclusively, suspending until it is granted.
    pub fn lock(&self) -> LockOperation<'_> {
        LockOperation {
            mutex: self,
            exclusive: true,
            waiter: None,
            done: false,
        }
    }

    /// Acquires the mutex shared, suspending until it is granted.
    pub fn lock_shared(&self) -> LockOperation<'_> {
        LockOperation {
            mutex: self,
            exclusive: false,
            waiter: None,
            done: false,
        }
    }

    /// Acquires exclusively without suspending, if the mutex is unlocked.
    pub fn try_lock(&self) -> Option<SharedScopedLock<'_>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == LockState::Unlocked {
            inner.state = LockState::Exclusive;
            Some(self.guard(true))
        } else {
            None
        }
    }

    /// Acquires shared without suspending. Succeeds while the mutex is
    /// unlocked, or shared with no queued exclusive waiter.
    pub fn try_lock_shared(&self) -> Option<SharedScopedLock<'_>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            LockState::Unlocked => {
                inner.state = LockState::Shared;
                inner.shared_users = 1;
                Some(self.guard(false))
            }
            LockState::Shared if inner.exclusive_waiters == 0 => {
                inner.shared_users += 1;
                Some(self.guard(false))
            }
            _ => None,
        }
    }

    fn guard(&self, exclusive: bool) -> SharedScopedLock<'_> {
        SharedScopedLock {
            mutex: Some(self),
            exclusive,
        }
    }

    fn unlock_exclusive(&self) {
        let woken = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, LockState::Exclusive);
            Self::grant_next(&mut inner)
        };
        Self::wake(woken);
    }

    fn unlock_shared(&self) {
        let woken = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, LockState::Shared);
            debug_assert!(inner.shared_users > 0);
            inner.shared_users -= 1;
            if inner.shared_users > 0 {
                return;
            }
            Self::grant_next(&mut inner)
        };
        Self::wake(woken);
    }

    /// Hands the mutex to the head of the queue. Called with the mutex in its
    /// released moment, under the inner lock; the waiters to wake are returned
    /// so they can be resumed after the lock is dropped.
    fn grant_next(inner: &mut Inner) -> Vec<Arc<LockWaiter>> {
        match inner.waiters.front() {
            None => {
                inner.state = LockState::Unlocked;
                inner.shared_users = 0;
                Vec::new()
            }
            Some(head) if head.exclusive => {
                inner.state = LockState::Exclusive;
                inner.shared_users = 0;
                inner.exclusive_waiters -= 1;
                let waiter = inner.waiters.pop_front().unwrap();
                vec![waiter]
            }
            Some(_) => {
                inner.state = LockState::Shared;
                inner.shared_users = 0;
                let mut batch = Vec::new();
                while let Some(front) = inner.waiters.front() {
                    if front.exclusive {
                        break;
                    }
                    inner.shared_users += 1;
                    batch.push(inner.waiters.pop_front().unwrap());
                }
                batch
            }
        }
    }

    fn wake(woken: Vec<Arc<LockWaiter>>) {
        for waiter in woken {
            let waker = {
                let mut state = waiter.state.lock().unwrap();
                state.granted = true;
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// Future returned by [`SharedMutex::lock`] and [`SharedMutex::lock_shared`].
///
/// Dropping a pending operation withdraws it from the waiter queue; dropping
/// it after an unobserved grant releases the lock again.
pub struct LockOperation<'a> {
    mutex: &'a SharedMutex,
    exclusive: bool,
    waiter: Option<Arc<LockWaiter>>,
    done: bool,
}

impl<'a> Future for LockOperation<'a> {
    type Output = SharedScopedLock<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = &this.waiter {
            let mut state = waiter.state.lock().unwrap();
            if state.granted {
                state.waker = None;
                drop(state);
                this.waiter = None;
                this.done = true;
                return Poll::Ready(this.mutex.guard(this.exclusive));
            }
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut inner = this.mutex.inner.lock().unwrap();
        let admitted = if this.exclusive {
            if inner.state == LockState::Unlocked {
                inner.state = LockState::Exclusive;
                true
            } else {
                false
            }
        } else {
            match inner.state {
                LockState::Unlocked => {
                    inner.state = LockState::Shared;
                    inner.shared_users = 1;
                    true
                }
                LockState::Shared if inner.exclusive_waiters == 0 => {
                    inner.shared_users += 1;
                    true
                }
                _ => false,
            }
        };

        if admitted {
            this.done = true;
            return Poll::Ready(this.mutex.guard(this.exclusive));
        }

        let waiter = Arc::new(LockWaiter {
            exclusive: this.exclusive,
            state: Mutex::new(WaiterState {
                granted: false,
                waker: Some(cx.waker().clone()),
            }),
        });
        if this.exclusive {
            inner.exclusive_waiters += 1;
        }
        inner.waiters.push_back(waiter.clone());
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for LockOperation<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        let mut inner = self.mutex.inner.lock().unwrap();
        if let Some(pos) = inner
            .waiters
            .iter()
            .position(|queued| Arc::ptr_eq(queued, &waiter))
        {
            inner.waiters.remove(pos);
            if waiter.exclusive {
                inner.exclusive_waiters -= 1;
            }
        } else {
            // Granted between the last poll and this drop; give the lock back.
            drop(inner);
            if waiter.exclusive {
                self.mutex.unlock_exclusive();
            } else {
                self.mutex.unlock_shared();
            }
        }
    }
}

/// RAII lock holder; releases the mutex in the mode it was acquired in.
pub struct SharedScopedLock<'a> {
    mutex: Option<&'a SharedMutex>,
    exclusive: bool,
}

impl SharedScopedLock<'_> {
    /// Releases the mutex before the guard goes out of scope.
    pub fn unlock(&mut self) {
        if let Some(mutex) = self.mutex.take() {
            if self.exclusive {
                mutex.unlock_exclusive();
            } else {
                mutex.unlock_shared();
            }
        }
    }
}

impl Drop for SharedScopedLock<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod test {
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll, Waker};

    use super::SharedMutex;
    use crate::runtime::thread_pool::ThreadPool;
    use crate::sync::Latch;
    use crate::sync_wait::sync_wait;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let mut cx = Context::from_waker(Waker::noop());
        Future::poll(std::pin::Pin::new(fut), &mut cx)
    }

    #[test]
    fn try_lock_semantics() {
        let mutex = SharedMutex::new();

        let shared = mutex.try_lock_shared().unwrap();
        assert!(mutex.try_lock().is_none());
        let shared2 = mutex.try_lock_shared().unwrap();
        drop(shared);
        drop(shared2);

        let exclusive = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        assert!(mutex.try_lock_shared().is_none());
        drop(exclusive);

        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn guard_unlock_releases_early() {
        let mutex = SharedMutex::new();
        let mut guard = mutex.try_lock().unwrap();
        guard.unlock();
        assert!(mutex.try_lock().is_some());
        drop(guard);
    }

    // The fairness scenario: R1 holds shared, a writer W queues, then readers
    // R2 and R3 arrive. Grant order must be R1, W, then R2+R3 as one batch.
    #[test]
    fn writer_is_served_before_late_readers() {
        let mutex = SharedMutex::new();

        let r1 = mutex.try_lock_shared().unwrap();

        let mut w = Box::pin(mutex.lock());
        assert!(poll_once(&mut w).is_pending());

        // A queued writer gates new readers.
        assert!(mutex.try_lock_shared().is_none());
        let mut r2 = Box::pin(mutex.lock_shared());
        let mut r3 = Box::pin(mutex.lock_shared());
        assert!(poll_once(&mut r2).is_pending());
        assert!(poll_once(&mut r3).is_pending());

        drop(r1);

        let w_guard = match poll_once(&mut w) {
            Poll::Ready(guard) => guard,
            Poll::Pending => panic!("writer was not granted after the last reader left"),
        };
        assert!(poll_once(&mut r2).is_pending());
        assert!(poll_once(&mut r3).is_pending());

        drop(w_guard);

        assert!(poll_once(&mut r2).is_ready());
        assert!(poll_once(&mut r3).is_ready());
    }

    #[test]
    fn dropping_a_queued_operation_withdraws_it() {
        let mutex = SharedMutex::new();
        let shared = mutex.try_lock_shared().unwrap();

        {
            let mut w = Box::pin(mutex.lock());
            assert!(poll_once(&mut w).is_pending());
            assert!(mutex.try_lock_shared().is_none());
        }

        // The withdrawn writer no longer gates readers.
        assert!(mutex.try_lock_shared().is_some());
        drop(shared);
    }

    #[test]
    fn exclusion_holds_under_contention() {
        let pool = ThreadPool::default();
        let mutex = Arc::new(SharedMutex::new());
        let holders = Arc::new(AtomicUsize::new(0));
        let writers_done = Arc::new(Latch::new(8));
        let readers_done = Arc::new(Latch::new(24));

        for _ in 0..8 {
            let mutex = mutex.clone();
            let holders = holders.clone();
            let done = writers_done.clone();
            pool.spawn(async move {
                for _ in 0..25 {
                    let guard = mutex.lock().await;
                    let seen = holders.fetch_add(1000, Ordering::SeqCst);
                    assert_eq!(seen, 0, "writer admitted while the mutex was held");
                    holders.fetch_sub(1000, Ordering::SeqCst);
                    drop(guard);
                }
                done.count_down(1);
            })
            .unwrap();
        }

        for _ in 0..24 {
            let mutex = mutex.clone();
            let holders = holders.clone();
            let done = readers_done.clone();
            pool.spawn(async move {
                for _ in 0..25 {
                    let guard = mutex.lock_shared().await;
                    let seen = holders.fetch_add(1, Ordering::SeqCst);
                    assert!(seen < 1000, "reader admitted while a writer held the mutex");
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
                done.count_down(1);
            })
            .unwrap();
        }

        sync_wait(async {
            writers_done.wait().await;
            readers_done.wait().await;
        });
        pool.shutdown();
    }
}
