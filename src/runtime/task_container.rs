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

//! Slot storage for detached tasks owned by the I/O scheduler

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::coroutine::Handle;

struct ContainerInner {
    /// Task slots addressed by index.
    slots: Vec<Option<Handle>>,
    /// Indices of unoccupied slots.
    free: VecDeque<usize>,
    /// Indices whose task finished and awaits destruction.
    dead: Vec<usize>,
}

/// Owns fire-and-forget coroutine frames until they complete and are
/// reclaimed. Grows geometrically when all slots are occupied.
pub(crate) struct TaskContainer {
    inner: Mutex<ContainerInner>,
    /// Stored tasks that have not completed yet (collection lags completion).
    live: AtomicUsize,
}

impl TaskContainer {
    pub(crate) fn new(reserve: usize) -> TaskContainer {
        let reserve = reserve.max(1);
        TaskContainer {
            inner: Mutex::new(ContainerInner {
                slots: (0..reserve).map(|_| None).collect(),
                free: (0..reserve).collect(),
                dead: Vec::new(),
            }),
            live: AtomicUsize::new(0),
        }
    }

    /// Reserves a slot, builds a task for it and stores the handle. Completed
    /// tasks are collected on the way in so slots get re-used.
    pub(crate) fn insert<F>(&self, make: F) -> Handle
    where
        F: FnOnce(usize) -> Handle,
    {
        let mut graveyard = Vec::new();
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            Self::collect(&mut inner, &mut graveyard);

            if inner.free.is_empty() {
                Self::grow(&mut inner);
            }
            let index = inner.free.pop_front().unwrap();

            let handle = make(index);
            inner.slots[index] = Some(handle.clone());
            self.live.fetch_add(1, Ordering::AcqRel);
            handle
        };
        drop(graveyard);
        handle
    }

    /// Flags a slot's task as finished. Called from the task's own completion
    /// path; the slot is reclaimed by a later collection.
    pub(crate) fn mark_done(&self, index: usize) {
        self.inner.lock().unwrap().dead.push(index);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Destroys every finished task and returns its slot to the free list.
    pub(crate) fn garbage_collect(&self) {
        let mut graveyard = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            Self::collect(&mut inner, &mut graveyard);
        }
        drop(graveyard);
    }

    /// Stored tasks that have not completed yet.
    pub(crate) fn size(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn occupied(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Frame destructors may re-enter the container (a torn-down frame marks
    /// its own slot), so the reclaimed handles are pushed into `graveyard`
    /// and dropped only after the lock is released.
    fn collect(inner: &mut ContainerInner, graveyard: &mut Vec<Handle>) {
        let dead = mem::take(&mut inner.dead);
        for index in dead {
            match &inner.slots[index] {
                Some(handle) if handle.is_finished() => {
                    graveyard.push(inner.slots[index].take().unwrap());
                    inner.free.push_back(index);
                }
                Some(_) => inner.dead.push(index),
                None => {}
            }
        }
    }

    fn grow(inner: &mut ContainerInner) {
        let old = inner.slots.len();
        let new = (old * 2).max(8);
        inner.slots.resize_with(new, || None);
        inner.free.extend(old..new);
    }
}

impl Drop for TaskContainer {
    fn drop(&mut self) {
        let slots = mem::take(&mut self.inner.get_mut().unwrap().slots);
        // Dropping unfinished frames runs their destructors, which call back
        // into `mark_done`; the lock is not held here.
        drop(slots);
    }
}
