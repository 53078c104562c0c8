#![no_std]

//! Cooperative task queue for kernel background work.
//!
//! Kernel tasks (for example the pageout daemon) are spawned onto a global
//! run queue and driven by whoever holds the processor: the kernel main loop
//! on a live system, or [`block_on`] in tests. Tasks run to completion
//! between suspension points; there is no preemption.

extern crate alloc;

use alloc::{collections::VecDeque, sync::Arc};
use core::{
    future::Future,
    pin::pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

use async_task::{Runnable, ScheduleInfo, WithInfo};
pub use async_task::Task;
use lazy_static::lazy_static;
use mutex::SpinLock;

lazy_static! {
    static ref RUN_QUEUE: RunQueue = RunQueue::new();
}

/// Queue of runnable kernel tasks.
struct RunQueue {
    tasks: SpinLock<VecDeque<Runnable>>,
}

impl RunQueue {
    fn new() -> Self {
        Self {
            tasks: SpinLock::new(VecDeque::new()),
        }
    }

    fn push(&self, task: Runnable) {
        self.tasks.lock().push_back(task);
    }

    fn push_front(&self, task: Runnable) {
        self.tasks.lock().push_front(task);
    }

    fn fetch(&self) -> Option<Runnable> {
        self.tasks.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// Spawns a kernel task onto the run queue and returns its handle.
///
/// Dropping the returned [`Task`] cancels the task; call [`Task::detach`] to
/// let it run unsupervised.
pub fn spawn<F>(future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let schedule = move |runnable: Runnable, info: ScheduleInfo| {
        if info.woken_while_running {
            RUN_QUEUE.push(runnable);
        } else {
            RUN_QUEUE.push_front(runnable);
        }
    };
    let (runnable, task) = async_task::spawn(future, WithInfo(schedule));
    runnable.schedule();
    task
}

/// Runs queued tasks until the queue drains.
pub fn run_until_idle() {
    while let Some(task) = RUN_QUEUE.fetch() {
        task.run();
    }
}

/// Runs at most one queued task. Returns whether one ran.
pub fn run_one() -> bool {
    match RUN_QUEUE.fetch() {
        Some(task) => {
            task.run();
            true
        }
        None => false,
    }
}

/// Returns whether any task is waiting on the run queue.
pub fn has_runnable_task() -> bool {
    RUN_QUEUE.len() > 0
}

/// Drives `future` to completion, interleaving queued kernel tasks whenever
/// it suspends.
///
/// # Panics
/// Panics if `future` is suspended while no task is runnable and nothing has
/// woken it: every task in the system is asleep, which in a cooperative
/// kernel is a deadlock.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let woken = Arc::new(AtomicBool::new(true));
    let waker = flag_waker(woken.clone());
    let mut cx = Context::from_waker(&waker);
    let mut idle_spins: usize = 0;

    loop {
        if woken.swap(false, Ordering::AcqRel) {
            idle_spins = 0;
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
        }
        if run_one() {
            idle_spins = 0;
            continue;
        }
        if woken.load(Ordering::Acquire) {
            continue;
        }
        // Nothing runnable and nothing woke us. Another processor may still
        // be about to; only a long quiet spell is called a deadlock.
        idle_spins += 1;
        if idle_spins == 0x1000_0000 {
            panic!("block_on: every task is blocked");
        }
        core::hint::spin_loop();
    }
}

/// Builds a waker that records wakeups in an atomic flag.
fn flag_waker(flag: Arc<AtomicBool>) -> Waker {
    unsafe fn clone(data: *const ()) -> RawWaker {
        unsafe { Arc::increment_strong_count(data as *const AtomicBool) };
        RawWaker::new(data, &VTABLE)
    }
    unsafe fn wake(data: *const ()) {
        let flag = unsafe { Arc::from_raw(data as *const AtomicBool) };
        flag.store(true, Ordering::Release);
    }
    unsafe fn wake_by_ref(data: *const ()) {
        let flag = unsafe { &*(data as *const AtomicBool) };
        flag.store(true, Ordering::Release);
    }
    unsafe fn drop_waker(data: *const ()) {
        drop(unsafe { Arc::from_raw(data as *const AtomicBool) });
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_waker);

    let raw = RawWaker::new(Arc::into_raw(flag) as *const (), &VTABLE);
    // SAFETY: the vtable functions uphold the `RawWaker` contract for an
    // `Arc`-backed waker.
    unsafe { Waker::from_raw(raw) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_plain_future() {
        assert_eq!(block_on(async { 6 * 7 }), 42);
    }

    #[test]
    fn block_on_runs_spawned_tasks() {
        let task = spawn(async { 1 + 1 });
        let value = block_on(task);
        assert_eq!(value, 2);
    }
}
