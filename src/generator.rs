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

//! Lazy, pull-driven generator
//!
//! A [`Generator`] is a single-pass sequence produced by a coroutine frame
//! that parks itself at every [`Yielder::yield_value`] point. Each call to
//! `next()` resumes the frame exactly once; running off the end of the frame
//! ends the iteration. The generator is move-only and cannot be restarted.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// The yield side of a generator, handed to the coroutine body.
pub struct Yielder<T> {
    slot: Rc<Cell<Option<T>>>,
}

impl<T> Yielder<T> {
    /// Produces the next value of the sequence and parks the frame until the
    /// consumer pulls again.
    pub fn yield_value(&self, value: T) -> YieldFuture<T> {
        YieldFuture {
            slot: self.slot.clone(),
            value: Some(value),
        }
    }
}

/// Future returned by [`Yielder::yield_value`]; pending exactly once.
pub struct YieldFuture<T> {
    slot: Rc<Cell<Option<T>>>,
    value: Option<T>,
}

impl<T> Unpin for YieldFuture<T> {}

impl<T> Future for YieldFuture<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.value.take() {
            Some(value) => {
                this.slot.set(Some(value));
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// A lazy sequence of `T` values pulled out of a coroutine frame.
///
/// The generator is not an awaitable and its frame must only ever suspend at
/// its own yield points; suspending on anything else is a programmer error.
pub struct Generator<T> {
    slot: Rc<Cell<Option<T>>>,
    frame: Option<Pin<Box<dyn Future<Output = ()> + 'static>>>,
}

impl<T: 'static> Generator<T> {
    /// Builds a generator from a coroutine body.
    ///
    /// The body receives a [`Yielder`] and runs lazily: nothing executes until
    /// the first `next()` resumes the frame up to the first yield point.
    pub fn new<F, Fut>(body: F) -> Generator<T>
    where
        F: FnOnce(Yielder<T>) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let slot = Rc::new(Cell::new(None));
        let frame = body(Yielder { slot: slot.clone() });
        Generator {
            slot,
            frame: Some(Box::pin(frame)),
        }
    }
}

impl<T: 'static> Iterator for Generator<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let frame = self.frame.as_mut()?;
        let mut cx = Context::from_waker(Waker::noop());
        match frame.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.frame = None;
                None
            }
            Poll::Pending => match self.slot.take() {
                Some(value) => Some(value),
                None => panic!("generator frame suspended outside of a yield point"),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::Generator;

    #[test]
    fn sums_the_first_hundred_and_one_values() {
        let gen = Generator::new(|y| async move {
            let mut i: u64 = 0;
            loop {
                y.yield_value(i).await;
                i += 1;
            }
        });

        let mut sum = 0u64;
        for value in gen {
            sum += value;
            if value >= 100 {
                break;
            }
        }
        assert_eq!(sum, 5050);
    }

    #[test]
    fn finite_generator_terminates() {
        let gen = Generator::new(|y| async move {
            for i in 0..3u32 {
                y.yield_value(i).await;
            }
        });
        let collected: Vec<u32> = gen.collect();
        assert_eq!(collected, vec![0, 1, 2]);
    }

    #[test]
    fn body_runs_lazily() {
        use std::cell::Cell;
        use std::rc::Rc;

        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let mut gen = Generator::new(move |y| async move {
            flag.set(true);
            y.yield_value(1u8).await;
        });

        assert!(!ran.get());
        assert_eq!(gen.next(), Some(1));
        assert!(ran.get());
    }

    #[test]
    fn exhausted_generator_keeps_returning_none() {
        let mut gen = Generator::new(|y| async move {
            y.yield_value(9i32).await;
        });
        assert_eq!(gen.next(), Some(9));
        assert_eq!(gen.next(), None);
        assert_eq!(gen.next(), None);
    }

    #[test]
    fn panics_escape_from_the_resuming_next() {
        let mut gen = Generator::new(|y| async move {
            y.yield_value(1u32).await;
            panic!("stream broke");
        });
        assert_eq!(gen.next(), Some(1));

        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| gen.next()));
        assert!(err.is_err());
    }
}
