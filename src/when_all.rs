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

//! Structured concurrency combinator
//!
//! [`when_all`] takes a tuple of awaitables (or a `Vec` of same-typed ones),
//! owns the children, and completes only when every child has completed. Child
//! results are delivered in position order. A panic inside any child
//! propagates at the parent's await.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Resolves when all of the given awaitables have completed.
///
/// Accepts a tuple of up to five heterogeneous awaitables, producing a tuple
/// of their results, or a `Vec` of awaitables of one type, producing a `Vec`.
pub fn when_all<W: IntoWhenAll>(awaitables: W) -> W::Awaitable {
    awaitables.into_when_all()
}

/// Conversion into an owning all-of combinator. Implemented for future tuples
/// and for `Vec<F>`.
pub trait IntoWhenAll {
    /// The combined awaitable.
    type Awaitable: Future;

    fn into_when_all(self) -> Self::Awaitable;
}

/// All-of combinator over a homogeneous set of awaitables.
pub struct WhenAllVec<F: Future> {
    children: Vec<Option<Pin<Box<F>>>>,
    results: Vec<Option<F::Output>>,
    remaining: usize,
}

impl<F: Future> Unpin for WhenAllVec<F> {}

impl<F: Future> Future for WhenAllVec<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for index in 0..this.children.len() {
            if let Some(child) = this.children[index].as_mut() {
                if let Poll::Ready(value) = child.as_mut().poll(cx) {
                    this.children[index] = None;
                    this.results[index] = Some(value);
                    this.remaining -= 1;
                }
            }
        }
        if this.remaining == 0 {
            let results = this
                .results
                .iter_mut()
                .map(|slot| slot.take().expect("child result was never set"))
                .collect();
            Poll::Ready(results)
        } else {
            Poll::Pending
        }
    }
}

impl<F: Future> IntoWhenAll for Vec<F> {
    type Awaitable = WhenAllVec<F>;

    fn into_when_all(self) -> WhenAllVec<F> {
        let remaining = self.len();
        let mut results = Vec::with_capacity(remaining);
        results.resize_with(remaining, || None);
        WhenAllVec {
            children: self.into_iter().map(|f| Some(Box::pin(f))).collect(),
            results,
            remaining,
        }
    }
}

macro_rules! tuple_when_all {
    ($name:ident => $(($F:ident, $fut:ident, $out:ident)),+) => {
        /// All-of combinator over a tuple of awaitables.
        pub struct $name<$($F: Future),+> {
            $($fut: Option<Pin<Box<$F>>>,)+
            $($out: Option<$F::Output>,)+
        }

        impl<$($F: Future),+> Unpin for $name<$($F),+> {}

        impl<$($F: Future),+> Future for $name<$($F),+> {
            type Output = ($($F::Output,)+);

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = self.get_mut();
                $(
                    if let Some(child) = this.$fut.as_mut() {
                        if let Poll::Ready(value) = child.as_mut().poll(cx) {
                            this.$fut = None;
                            this.$out = Some(value);
                        }
                    }
                )+
                if $(this.$fut.is_none())&&+ {
                    Poll::Ready(($(
                        this.$out.take().expect("child result was never set"),
                    )+))
                } else {
                    Poll::Pending
                }
            }
        }

        impl<$($F: Future),+> IntoWhenAll for ($($F,)+) {
            type Awaitable = $name<$($F),+>;

            fn into_when_all(self) -> Self::Awaitable {
                let ($($fut,)+) = self;
                $name {
                    $($fut: Some(Box::pin($fut)),)+
                    $($out: None,)+
                }
            }
        }
    };
}

tuple_when_all!(WhenAll2 => (F1, f1, o1), (F2, f2, o2));
tuple_when_all!(WhenAll3 => (F1, f1, o1), (F2, f2, o2), (F3, f3, o3));
tuple_when_all!(WhenAll4 => (F1, f1, o1), (F2, f2, o2), (F3, f3, o3), (F4, f4, o4));
tuple_when_all!(WhenAll5 => (F1, f1, o1), (F2, f2, o2), (F3, f3, o3), (F4, f4, o4), (F5, f5, o5));

#[cfg(test)]
mod test {
    use super::when_all;
    use crate::sync::{Event, Latch};
    use crate::sync_wait::sync_wait;
    use std::sync::Arc;

    #[test]
    fn tuple_results_preserve_positions() {
        let (a, b, c) = sync_wait(when_all((
            async { 1u32 },
            async { String::from("two") },
            async { 3i64 },
        )));
        assert_eq!(a, 1);
        assert_eq!(b, "two");
        assert_eq!(c, 3);
    }

    #[test]
    fn vec_results_preserve_positions() {
        let futures: Vec<_> = (0..10u64).map(|i| async move { i * i }).collect();
        let results = sync_wait(when_all(futures));
        assert_eq!(results, (0..10u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn empty_vec_completes_immediately() {
        let futures: Vec<std::future::Ready<u8>> = Vec::new();
        assert!(sync_wait(when_all(futures)).is_empty());
    }

    #[test]
    fn completes_only_after_every_child() {
        let event = Arc::new(Event::new());
        let latch = Arc::new(Latch::new(2));

        let e1 = event.clone();
        let e2 = event.clone();
        let l1 = latch.clone();
        let l2 = latch.clone();

        let combined = when_all((
            async move {
                e1.wait().await;
                l1.count_down(1);
                "first"
            },
            async move {
                e2.wait().await;
                l2.count_down(1);
                "second"
            },
        ));

        let setter = {
            let event = event.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                event.set();
            })
        };

        let (a, b) = sync_wait(combined);
        assert_eq!((a, b), ("first", "second"));
        assert!(latch.is_ready());
        setter.join().unwrap();
    }
}
