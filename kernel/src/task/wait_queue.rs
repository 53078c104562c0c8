//! Wait queues for cooperative kernel tasks.
//!
//! A wait queue stores the wakers of suspended tasks. `broadcast` bumps the
//! queue's epoch and wakes everyone; a waiter that was created before the
//! broadcast completes immediately on its next poll, so a wakeup arriving
//! between queue inspection and suspension is not lost.

use alloc::vec::Vec;
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};

use mutex::SpinLock;
use systype::{SysError, SysResult};

/// A queue of suspended tasks.
pub struct WaitQueue {
    inner: SpinLock<WaitQueueInner>,
}

struct WaitQueueInner {
    epoch: u64,
    waiters: Vec<core::task::Waker>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(WaitQueueInner {
                epoch: 0,
                waiters: Vec::new(),
            }),
        }
    }

    /// Wakes every task currently waiting on the queue.
    pub fn broadcast(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            core::mem::take(&mut inner.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }

    /// Suspends until the next broadcast.
    ///
    /// The returned future observes broadcasts issued any time after this
    /// call, even before its first poll.
    pub fn wait(&self) -> WaitFuture<'_> {
        WaitFuture {
            queue: self,
            epoch: self.inner.lock().epoch,
        }
    }

    /// Like [`wait`](Self::wait), but also wakes up with `EINTR` once
    /// `cancelled` becomes true and the queue is broadcast.
    pub async fn wait_cancellable(&self, cancelled: &AtomicBool) -> SysResult<()> {
        if cancelled.load(Ordering::Relaxed) {
            return Err(SysError::EINTR);
        }
        self.wait().await;
        if cancelled.load(Ordering::Relaxed) {
            return Err(SysError::EINTR);
        }
        Ok(())
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`WaitQueue::wait`].
pub struct WaitFuture<'a> {
    queue: &'a WaitQueue,
    epoch: u64,
}

impl Future for WaitFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.queue.inner.lock();
        if inner.epoch != self.epoch {
            return Poll::Ready(());
        }
        if !inner.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            inner.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn broadcast_wakes_waiter() {
        let queue = Arc::new(WaitQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            executor::spawn(async move {
                queue.wait().await;
                7
            })
        };
        let value = executor::block_on(async move {
            // Let the waiter run once so it suspends on the queue.
            osfuture::yield_now().await;
            queue.broadcast();
            waiter.await
        });
        assert_eq!(value, 7);
    }

    #[test]
    fn broadcast_before_first_poll_is_not_lost() {
        let queue = WaitQueue::new();
        let wait = queue.wait();
        queue.broadcast();
        executor::block_on(wait);
    }

    #[test]
    fn cancellation_unwinds_with_eintr() {
        let queue = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));
        let task = {
            let (queue, flag) = (Arc::clone(&queue), Arc::clone(&flag));
            executor::spawn(async move { queue.wait_cancellable(&flag).await })
        };
        flag.store(true, Ordering::Relaxed);
        queue.broadcast();
        assert_eq!(executor::block_on(task), Err(SysError::EINTR));
    }
}
