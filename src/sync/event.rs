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

//! Manual-reset, one-to-many event
//!
//! The whole event is one atomic word. `null` means unset with no waiters, a
//! distinguished sentinel address means set, and anything else is the head of
//! an intrusive LIFO list of waiter nodes pushed with CAS. A waiter therefore
//! either parks itself on the list or observes the set state; there is no
//! window in which it can do neither.

use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// The order waiters are resumed in when the event is set.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeOrderPolicy {
    /// Last in, first out. The cheapest policy: the list is walked as stored.
    Lifo,
    /// First in, first out, at the cost of reversing the list once per set.
    Fifo,
}

struct Waiter {
    waker: Mutex<Option<Waker>>,
    notified: AtomicBool,
    /// Next node towards the tail; written before publication, immutable after.
    next: AtomicPtr<Waiter>,
}

/// Address used as the "set" state. Never dereferenced, only compared.
static SET_SENTINEL: u8 = 0;

fn set_state() -> *mut Waiter {
    &SET_SENTINEL as *const u8 as *mut Waiter
}

/// A manually triggered, thread safe signal that any number of coroutines can
/// wait for.
///
/// Once set, every current waiter is resumed and every future waiter returns
/// without suspending, until [`Event::reset`] rearms the event.
pub struct Event {
    state: AtomicPtr<Waiter>,
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

impl Event {
    pub fn new() -> Event {
        Event {
            state: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == set_state()
    }

    /// Sets the event and resumes all waiters in LIFO order.
    pub fn set(&self) {
        self.set_with(ResumeOrderPolicy::Lifo);
    }

    /// Sets the event and resumes all waiters in the given order.
    pub fn set_with(&self, policy: ResumeOrderPolicy) {
        let head = self.state.swap(set_state(), Ordering::AcqRel);
        if head == set_state() || head.is_null() {
            return;
        }

        let mut nodes: Vec<*mut Waiter> = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            nodes.push(cursor);
            cursor = unsafe { (*cursor).next.load(Ordering::Relaxed) };
        }
        if policy == ResumeOrderPolicy::Fifo {
            nodes.reverse();
        }

        for node in nodes {
            // Reclaim the reference the list was holding.
            let node = unsafe { Arc::from_raw(node as *const Waiter) };
            node.notified.store(true, Ordering::Release);
            let waker = node.waker.lock().unwrap().take();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    /// Rearms a set event. No-op when the event is unset or has waiters.
    pub fn reset(&self) {
        let _ = self.state.compare_exchange(
            set_state(),
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Suspends until the event is set. Returns immediately if it already is.
    pub fn wait(&self) -> EventWait<'_> {
        EventWait {
            event: self,
            node: None,
        }
    }

    #[cfg(test)]
    fn waiter_len(&self) -> usize {
        let mut cursor = self.state.load(Ordering::Acquire);
        if cursor == set_state() {
            return 0;
        }
        let mut len = 0;
        while !cursor.is_null() {
            len += 1;
            cursor = unsafe { (*cursor).next.load(Ordering::Relaxed) };
        }
        len
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // Release the list references of waiters that never got resumed.
        let mut cursor = *self.state.get_mut();
        if cursor == set_state() {
            return;
        }
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
            drop(unsafe { Arc::from_raw(cursor as *const Waiter) });
            cursor = next;
        }
    }
}

/// Future returned by [`Event::wait`].
pub struct EventWait<'a> {
    event: &'a Event,
    node: Option<Arc<Waiter>>,
}

impl Future for EventWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match &this.node {
            None => {
                if this.event.is_set() {
                    return Poll::Ready(());
                }

                let node = Arc::new(Waiter {
                    waker: Mutex::new(Some(cx.waker().clone())),
                    notified: AtomicBool::new(false),
                    next: AtomicPtr::new(ptr::null_mut()),
                });
                // One reference for the list, one kept by this future.
                let raw = Arc::into_raw(node.clone()) as *mut Waiter;

                let mut old = this.event.state.load(Ordering::Acquire);
                loop {
                    if old == set_state() {
                        // Lost the race against set(); resume without parking.
                        drop(unsafe { Arc::from_raw(raw as *const Waiter) });
                        return Poll::Ready(());
                    }
                    node.next.store(old, Ordering::Relaxed);
                    match this.event.state.compare_exchange_weak(
                        old,
                        raw,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => old = actual,
                    }
                }
                this.node = Some(node);
                Poll::Pending
            }
            Some(node) => {
                if node.notified.load(Ordering::Acquire) {
                    return Poll::Ready(());
                }
                *node.waker.lock().unwrap() = Some(cx.waker().clone());
                // A set() may have taken the previous waker between the two
                // checks; it stores `notified` before waking.
                if node.notified.load(Ordering::Acquire) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for EventWait<'_> {
    fn drop(&mut self) {
        let Some(node) = self.node.take() else {
            return;
        };
        if node.notified.load(Ordering::Acquire) {
            // A set() already consumed the list's reference to this node.
            return;
        }

        // A parked node must not outlive its future. While the node is the
        // list head it can be unlinked outright; a successful exchange proves
        // no set() intervened, so `next` is still the intact remainder of the
        // list.
        let raw = Arc::as_ptr(&node) as *mut Waiter;
        let next = node.next.load(Ordering::Relaxed);
        if self
            .event
            .state
            .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Reclaim the reference the list was holding.
            drop(unsafe { Arc::from_raw(raw as *const Waiter) });
            return;
        }

        // Interior node, or a set() is in flight: tombstone it. Whichever
        // walk eventually reaches the node finds no waker to fire and merely
        // releases its reference.
        node.waker.lock().unwrap().take();
    }
}
