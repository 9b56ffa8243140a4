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

//! Count-down latch

use std::sync::atomic::{AtomicI64, Ordering};

use super::event::{Event, EventWait};

/// A monotonic count-down latch backed by an [`Event`].
///
/// The counter only ever decreases; once the cumulative count-downs reach the
/// initial count the embedded event is set and every waiter resumes.
pub struct Latch {
    count: AtomicI64,
    event: Event,
}

impl Latch {
    /// Creates a latch that becomes ready after `count` count-downs. A latch
    /// created with a non-positive count starts ready.
    pub fn new(count: i64) -> Latch {
        let latch = Latch {
            count: AtomicI64::new(count),
            event: Event::new(),
        };
        if count <= 0 {
            latch.event.set();
        }
        latch
    }

    /// How many count-downs are still outstanding.
    pub fn remaining(&self) -> u64 {
        self.count.load(Ordering::Acquire).max(0) as u64
    }

    pub fn is_ready(&self) -> bool {
        self.event.is_set()
    }

    /// Subtracts `n` from the counter; the waiters are resumed by whichever
    /// call drives the counter to zero or below.
    pub fn count_down(&self, n: i64) {
        let previous = self.count.fetch_sub(n, Ordering::AcqRel);
        if previous <= n {
            self.event.set();
        }
    }

    /// Suspends until the latch is ready.
    pub fn wait(&self) -> EventWait<'_> {
        self.event.wait()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::Latch;
    use crate::runtime::thread_pool::ThreadPool;
    use crate::sync_wait::sync_wait;

    #[test]
    fn non_positive_count_starts_ready() {
        assert!(Latch::new(0).is_ready());
        assert!(Latch::new(-3).is_ready());
        sync_wait(Latch::new(0).wait());
    }

    #[test]
    fn becomes_ready_once_counts_accumulate() {
        let latch = Latch::new(3);
        assert_eq!(latch.remaining(), 3);
        latch.count_down(1);
        assert!(!latch.is_ready());
        latch.count_down(1);
        assert!(!latch.is_ready());
        latch.count_down(1);
        assert!(latch.is_ready());
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn over_counting_still_completes() {
        let latch = Latch::new(2);
        latch.count_down(5);
        assert!(latch.is_ready());
    }

    #[test]
    fn workers_release_a_waiting_coroutine() {
        let pool = ThreadPool::default();
        let latch = Arc::new(Latch::new(5));

        for _ in 0..5 {
            let latch = latch.clone();
            pool.spawn(async move {
                latch.count_down(1);
            })
            .unwrap();
        }

        sync_wait(latch.wait());
        assert!(latch.is_ready());
        pool.shutdown();
    }
}
