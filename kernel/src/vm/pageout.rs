//! The pageout daemon.
//!
//! A single cancellable kernel task. It sleeps until the page allocator's
//! free count falls to the low watermark (wakeups are edge-triggered by
//! cache misses and failed allocations), then walks the allocated list from
//! its least-recently-requested head: busy frames are waited out, dirty
//! frames are cleaned, clean frames are reclaimed, until the free count
//! reaches the target. Finally it releases everybody blocked on "memory
//! available" and goes back to sleep.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use systype::SysResult;

use crate::{
    runtime::MemSystem,
    task::wait_queue::WaitQueue,
    vm::frame_cache::{EvictStep, FrameCache},
};

/// Watermarks and wait channels of the pageout daemon.
pub struct PageoutControl {
    /// The daemon sleeps here between reclaim passes.
    daemon_waitq: WaitQueue,
    /// Threads out of memory sleep here until a pass completes.
    reclaim_waitq: WaitQueue,
    freepages_min: usize,
    freepages_target: usize,
    cancelled: AtomicBool,
}

impl PageoutControl {
    pub fn new(freepages_min: usize, freepages_target: usize) -> Self {
        debug_assert!(freepages_min <= freepages_target);
        Self {
            daemon_waitq: WaitQueue::new(),
            reclaim_waitq: WaitQueue::new(),
            freepages_min,
            freepages_target,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Whether the daemon has work: the pool is at or below the low
    /// watermark and something is reclaimable.
    pub fn needed(&self, cache: &FrameCache) -> bool {
        cache.free_page_count() <= self.freepages_min && cache.allocated_count() > 0
    }

    /// Whether a reclaim pass may stop.
    pub fn target_met(&self, cache: &FrameCache) -> bool {
        cache.free_page_count() >= self.freepages_target
    }

    /// Edge-triggered wakeup, called by the cache on misses and failed
    /// allocations.
    pub fn wakeup(&self) {
        self.daemon_waitq.broadcast();
    }

    /// Suspends until the daemon finishes its next reclaim pass.
    pub async fn wait_for_reclaim(&self) {
        self.reclaim_waitq.wait().await;
    }

    /// Asks the daemon to exit; it unwinds at its next sleep.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.daemon_waitq.broadcast();
        // Nobody will reclaim for them any more; let waiters retry and fail
        // or make do.
        self.reclaim_waitq.broadcast();
    }

    async fn sleep(&self) -> SysResult<()> {
        self.daemon_waitq.wait_cancellable(&self.cancelled).await
    }
}

/// The daemon's main loop. Runs as a spawned kernel task; see
/// [`MemSystem::start_pageoutd`].
pub async fn pageoutd(sys: Arc<MemSystem>) {
    log::info!(
        "pageoutd: running (free={}, target={})",
        sys.cache.free_page_count(),
        sys.pageout.freepages_target
    );
    loop {
        while !sys.pageout.target_met(&sys.cache) {
            match sys.cache.evict_candidate() {
                None => break,
                Some(EvictStep::Busy(waitq)) => waitq.wait().await,
                Some(EvictStep::Clean(frame)) => {
                    if let Err(err) = sys.cache.clean(&sys, frame).await {
                        log::warn!("pageoutd: cleaning frame {frame} failed: {err:?}");
                        // Skip it; try the rest of the list first.
                        sys.cache.requeue(frame);
                    }
                }
                Some(EvictStep::Free(frame)) => sys.cache.free(&sys, frame),
            }
        }

        // Release the thundering herd.
        sys.pageout.reclaim_waitq.broadcast();

        log::debug!(
            "pageoutd: falling asleep (free={}, min={}, target={})",
            sys.cache.free_page_count(),
            sys.pageout.freepages_min,
            sys.pageout.freepages_target
        );
        if sys.pageout.sleep().await.is_err() {
            log::info!("pageoutd: cancelled, exiting");
            return;
        }
    }
}
