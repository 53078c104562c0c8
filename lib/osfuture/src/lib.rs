#![no_std]

//! Small futures used as suspension primitives by kernel tasks.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Relinquishes the processor, letting every other runnable task run once
/// before this task is scheduled again.
pub async fn yield_now() {
    YieldFuture::new().await
}

struct YieldFuture {
    has_yielded: bool,
}

impl YieldFuture {
    const fn new() -> Self {
        Self { has_yielded: false }
    }
}

impl Future for YieldFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.has_yielded {
            true => Poll::Ready(()),
            false => {
                self.has_yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}
