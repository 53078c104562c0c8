//! The page-frame cache.
//!
//! Every page resident in memory is identified by its owning memory object
//! and a page number within it. Frames live in an arena of slots indexed by
//! a stable [`FrameId`]; a hash over `(object, page-number)` gives O(1)
//! lookup, and two index-linked lists thread the slots:
//!
//! - the *allocated* list, kept in least-recently-requested order: `get`
//!   and `get_resident` move an unpinned frame to the tail, the pageout
//!   daemon evicts from the head;
//! - the *pinned* list, for frames with a positive pin count, which may
//!   not be reclaimed or cleaned.
//!
//! A frame being filled or written back carries the `BUSY` flag; everybody
//! else waits on the frame's wait queue and then revalidates by identity,
//! never by slot index, since slots are recycled. The `DIRTY` flag is the
//! authoritative dirty state; the MMU's is synthesised by mapping clean
//! pages read-only so the first write refaults.

use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};

use bitflags::bitflags;
use hashbrown::HashMap;

use mm::{address::PhysPageNum, frame::FrameAllocator};
use mutex::SpinLock;
use systype::{SysError, SysResult};

use crate::{
    runtime::MemSystem,
    task::wait_queue::WaitQueue,
    vm::memobj::{MemObj, ObjId},
};

/// Stable index of a frame slot in the cache arena.
pub type FrameId = usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FrameFlags: u8 {
        /// Modified since the last fill or clean.
        const DIRTY = 1 << 0;
        /// Mid-fill or mid-writeback; may not be freed, reclaimed or
        /// cleaned, and its contents may not be relied on.
        const BUSY = 1 << 1;
    }
}

struct FrameSlot {
    ppn: PhysPageNum,
    owner: Weak<MemObj>,
    owner_id: ObjId,
    pagenum: usize,
    flags: FrameFlags,
    pin_count: usize,
    prev: Option<FrameId>,
    next: Option<FrameId>,
    waitq: Arc<WaitQueue>,
}

#[derive(Default)]
struct FrameList {
    head: Option<FrameId>,
    tail: Option<FrameId>,
    len: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListSel {
    Allocated,
    Pinned,
}

struct CacheInner {
    slots: Vec<Option<FrameSlot>>,
    recycled: Vec<FrameId>,
    hash: HashMap<(ObjId, usize), FrameId>,
    allocated: FrameList,
    pinned: FrameList,
}

/// The process-wide page-frame cache. One per [`MemSystem`].
pub struct FrameCache {
    frames: Arc<FrameAllocator>,
    inner: SpinLock<CacheInner>,
}

/// What the pageout daemon should do with the head of the allocated list.
pub(crate) enum EvictStep {
    Busy(Arc<WaitQueue>),
    Clean(FrameId),
    Free(FrameId),
}

impl CacheInner {
    fn slot(&self, id: FrameId) -> &FrameSlot {
        self.slots[id].as_ref().expect("stale frame id")
    }

    fn slot_mut(&mut self, id: FrameId) -> &mut FrameSlot {
        self.slots[id].as_mut().expect("stale frame id")
    }

    fn list_mut(&mut self, sel: ListSel) -> &mut FrameList {
        match sel {
            ListSel::Allocated => &mut self.allocated,
            ListSel::Pinned => &mut self.pinned,
        }
    }

    fn sel_of(&self, id: FrameId) -> ListSel {
        if self.slot(id).pin_count > 0 {
            ListSel::Pinned
        } else {
            ListSel::Allocated
        }
    }

    fn push_tail(&mut self, sel: ListSel, id: FrameId) {
        let tail = self.list_mut(sel).tail;
        {
            let slot = self.slot_mut(id);
            slot.prev = tail;
            slot.next = None;
        }
        match tail {
            Some(t) => self.slot_mut(t).next = Some(id),
            None => self.list_mut(sel).head = Some(id),
        }
        let list = self.list_mut(sel);
        list.tail = Some(id);
        list.len += 1;
    }

    fn unlink(&mut self, sel: ListSel, id: FrameId) {
        let (prev, next) = {
            let slot = self.slot_mut(id);
            let links = (slot.prev, slot.next);
            slot.prev = None;
            slot.next = None;
            links
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.list_mut(sel).head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.list_mut(sel).tail = prev,
        }
        self.list_mut(sel).len -= 1;
    }

    /// Sends an unpinned frame to the tail of the allocated list.
    fn touch(&mut self, id: FrameId) {
        if self.slot(id).pin_count == 0 {
            self.unlink(ListSel::Allocated, id);
            self.push_tail(ListSel::Allocated, id);
        }
    }

    /// Installs a fresh busy slot for `(obj, pagenum)` over frame `ppn`.
    fn install(&mut self, ppn: PhysPageNum, obj: &Arc<MemObj>, pagenum: usize) -> FrameId {
        let slot = FrameSlot {
            ppn,
            owner: Arc::downgrade(obj),
            owner_id: obj.id(),
            pagenum,
            flags: FrameFlags::BUSY,
            pin_count: 0,
            prev: None,
            next: None,
            waitq: Arc::new(WaitQueue::new()),
        };
        let id = match self.recycled.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.hash.insert((obj.id(), pagenum), id);
        self.push_tail(ListSel::Allocated, id);
        id
    }
}

impl FrameCache {
    pub fn new(frames: Arc<FrameAllocator>) -> Self {
        Self {
            frames,
            inner: SpinLock::new(CacheInner {
                slots: Vec::new(),
                recycled: Vec::new(),
                hash: HashMap::new(),
                allocated: FrameList::default(),
                pinned: FrameList::default(),
            }),
        }
    }

    /// Finds or creates the frame holding page `pagenum` of `obj`.
    ///
    /// A hit returns at once (possibly after waiting out a fill in flight:
    /// concurrent callers for one page observe at most one fill). A miss
    /// allocates a frame, sleeping on the pageout daemon when the pool is
    /// dry, and fills it through the object.
    ///
    /// The returned frame is not busy, and remains resident at least until
    /// the caller suspends without pinning it.
    pub async fn get(
        &self,
        sys: &Arc<MemSystem>,
        obj: &Arc<MemObj>,
        pagenum: usize,
    ) -> SysResult<FrameId> {
        loop {
            let busy_wait = {
                let mut inner = self.inner.lock();
                match inner.hash.get(&(obj.id(), pagenum)).copied() {
                    Some(id) => {
                        if inner.slot(id).flags.contains(FrameFlags::BUSY) {
                            Some(inner.slot(id).waitq.clone())
                        } else {
                            inner.touch(id);
                            return Ok(id);
                        }
                    }
                    None => None,
                }
            };
            if let Some(q) = busy_wait {
                q.wait().await;
                continue;
            }

            // Miss. Take a physical frame, deferring to the pageout daemon
            // when the pool is exhausted.
            let ppn = loop {
                match self.frames.alloc_one() {
                    Some(ppn) => break ppn,
                    None => {
                        log::debug!("frame cache: pool dry, waking pageoutd");
                        sys.pageout.wakeup();
                        sys.pageout.wait_for_reclaim().await;
                    }
                }
            };
            if sys.pageout.needed(self) {
                sys.pageout.wakeup();
            }

            // Somebody may have installed the page while we slept in the
            // allocation loop.
            let id = {
                let mut inner = self.inner.lock();
                if inner.hash.contains_key(&(obj.id(), pagenum)) {
                    drop(inner);
                    self.frames.free_one(ppn);
                    continue;
                }
                inner.install(ppn, obj, pagenum)
            };
            obj.note_resident_insert(id);

            let filled = obj.fill_page(sys, pagenum, id).await;
            let waitq = {
                let mut inner = self.inner.lock();
                let slot = inner.slot_mut(id);
                slot.flags.remove(FrameFlags::BUSY);
                slot.waitq.clone()
            };
            waitq.broadcast();
            return match filled {
                Ok(()) => Ok(id),
                Err(err) => {
                    self.discard(id);
                    Err(err)
                }
            };
        }
    }

    /// Returns the frame for `(obj, pagenum)` iff it is resident right now.
    /// Never allocates, never suspends; the frame may be busy.
    pub fn get_resident(&self, obj: &MemObj, pagenum: usize) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let id = inner.hash.get(&(obj.id(), pagenum)).copied()?;
        inner.touch(id);
        Some(id)
    }

    /// Like [`get_resident`](Self::get_resident), but waits out a busy
    /// frame, then re-resolves by identity.
    pub(crate) async fn get_resident_settled(
        &self,
        obj: &MemObj,
        pagenum: usize,
    ) -> Option<FrameId> {
        loop {
            let step = {
                let mut inner = self.inner.lock();
                match inner.hash.get(&(obj.id(), pagenum)).copied() {
                    None => None,
                    Some(id) => {
                        if inner.slot(id).flags.contains(FrameFlags::BUSY) {
                            Some(Err(inner.slot(id).waitq.clone()))
                        } else {
                            inner.touch(id);
                            Some(Ok(id))
                        }
                    }
                }
            };
            match step {
                None => return None,
                Some(Ok(id)) => return Some(id),
                Some(Err(q)) => q.wait().await,
            }
        }
    }

    /// Pins a frame so it cannot be reclaimed. Pins nest.
    pub fn pin(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        let count = {
            let slot = inner.slot_mut(id);
            slot.pin_count += 1;
            slot.pin_count
        };
        if count == 1 {
            inner.unlink(ListSel::Allocated, id);
            inner.push_tail(ListSel::Pinned, id);
        }
    }

    /// Releases one pin. After the last pin is gone the frame may be
    /// reclaimed any time the holder suspends.
    pub fn unpin(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        let count = {
            let slot = inner.slot_mut(id);
            debug_assert!(slot.pin_count > 0, "unpinning an unpinned frame");
            slot.pin_count -= 1;
            slot.pin_count
        };
        if count == 0 {
            inner.unlink(ListSel::Pinned, id);
            inner.push_tail(ListSel::Allocated, id);
        }
    }

    /// Marks a frame about to be modified: notifies the owning object (which
    /// may reserve backing storage) and sets the dirty flag, so the pageout
    /// daemon knows to clean the frame before reclaiming it.
    ///
    /// Must be called before the modification becomes visible. May suspend.
    ///
    /// # Errors
    /// `ENOSPC` if the object cannot back the write; `EAGAIN` if the frame
    /// was reclaimed while waiting for it to settle, in which case the
    /// caller restarts its resolution.
    pub async fn dirty(&self, id: FrameId) -> SysResult<()> {
        let ident = {
            let inner = self.inner.lock();
            let slot = inner.slot(id);
            (slot.owner_id, slot.pagenum)
        };
        // Wait out a concurrent fill or writeback, revalidating by identity.
        let (owner, waitq) = loop {
            let step = {
                let mut inner = self.inner.lock();
                match inner.hash.get(&ident).copied() {
                    Some(cur) if cur == id => {
                        let slot = inner.slot_mut(cur);
                        if slot.flags.contains(FrameFlags::BUSY) {
                            Err(slot.waitq.clone())
                        } else {
                            slot.flags.insert(FrameFlags::BUSY);
                            Ok((slot.owner.upgrade(), slot.waitq.clone()))
                        }
                    }
                    _ => return Err(SysError::EAGAIN),
                }
            };
            match step {
                Ok(t) => break t,
                Err(q) => q.wait().await,
            }
        };

        let result = match &owner {
            Some(obj) => obj.dirty_page(ident.1).await,
            None => Ok(()),
        };
        {
            let mut inner = self.inner.lock();
            let slot = inner.slot_mut(id);
            if result.is_ok() {
                slot.flags.insert(FrameFlags::DIRTY);
            }
            slot.flags.remove(FrameFlags::BUSY);
        }
        waitq.broadcast();
        result
    }

    /// Writes a dirty frame back through its owning object.
    ///
    /// The dirty flag is cleared *before* the write begins, so a write that
    /// races with the writeback re-dirties the frame rather than being
    /// lost; the frame's page-table entries are removed so that such a
    /// write refaults. The frame must be dirty, unpinned and not busy.
    pub async fn clean(&self, sys: &MemSystem, id: FrameId) -> SysResult<()> {
        let (owner, pagenum, ppn, waitq) = {
            let mut inner = self.inner.lock();
            let slot = inner.slot_mut(id);
            debug_assert!(slot.flags.contains(FrameFlags::DIRTY), "cleaning a clean frame");
            debug_assert!(slot.pin_count == 0, "cleaning a pinned frame");
            debug_assert!(!slot.flags.contains(FrameFlags::BUSY));
            slot.flags.remove(FrameFlags::DIRTY);
            slot.flags.insert(FrameFlags::BUSY);
            (
                slot.owner.upgrade(),
                slot.pagenum,
                slot.ppn,
                slot.waitq.clone(),
            )
        };
        log::debug!("frame cache: cleaning page {pagenum} of obj {:?}", owner.as_ref().map(|o| o.id()));
        // Any mapping of the frame must refault so the next write marks it
        // dirty again.
        self.remove_from_page_tables(sys, id);

        let result = match &owner {
            Some(obj) => obj.clean_page(sys, pagenum, ppn).await,
            None => Ok(()),
        };
        {
            let mut inner = self.inner.lock();
            let slot = inner.slot_mut(id);
            if result.is_err() {
                slot.flags.insert(FrameFlags::DIRTY);
            }
            slot.flags.remove(FrameFlags::BUSY);
        }
        waitq.broadcast();
        result
    }

    /// Reclaims a frame: removes it from every page table and every cache
    /// index and returns it to the page allocator. The frame must not be
    /// pinned or busy; a dirty frame's contents are discarded.
    pub fn free(&self, sys: &MemSystem, id: FrameId) {
        self.remove_from_page_tables(sys, id);
        let (ppn, owner) = {
            let mut inner = self.inner.lock();
            {
                let slot = inner.slot(id);
                assert!(slot.pin_count == 0, "freeing a pinned frame");
                assert!(!slot.flags.contains(FrameFlags::BUSY), "freeing a busy frame");
            }
            inner.unlink(ListSel::Allocated, id);
            let slot = inner.slots[id].take().expect("stale frame id");
            inner.hash.remove(&(slot.owner_id, slot.pagenum));
            inner.recycled.push(id);
            (slot.ppn, slot.owner)
        };
        self.frames.free_one(ppn);
        if let Some(obj) = owner.upgrade() {
            obj.note_resident_remove(id);
        }
    }

    /// Tears down a slot whose fill failed: nothing maps it and its owner
    /// still expects no page.
    fn discard(&self, id: FrameId) {
        let (ppn, owner) = {
            let mut inner = self.inner.lock();
            let sel = inner.sel_of(id);
            inner.unlink(sel, id);
            let slot = inner.slots[id].take().expect("stale frame id");
            inner.hash.remove(&(slot.owner_id, slot.pagenum));
            inner.recycled.push(id);
            (slot.ppn, slot.owner)
        };
        self.frames.free_one(ppn);
        if let Some(obj) = owner.upgrade() {
            obj.note_resident_remove(id);
        }
    }

    /// Writes back every dirty frame in the cache. Restarts its scan after
    /// every suspension, since the allocated list may have changed.
    pub async fn clean_all(&self, sys: &MemSystem) -> SysResult<()> {
        loop {
            let step = {
                let inner = self.inner.lock();
                let mut cursor = inner.allocated.head;
                let mut found = None;
                while let Some(id) = cursor {
                    let slot = inner.slot(id);
                    if slot.flags.contains(FrameFlags::BUSY) {
                        found = Some(Err(slot.waitq.clone()));
                        break;
                    }
                    if slot.flags.contains(FrameFlags::DIRTY) {
                        found = Some(Ok(id));
                        break;
                    }
                    cursor = slot.next;
                }
                found
            };
            match step {
                None => return Ok(()),
                Some(Err(q)) => q.wait().await,
                Some(Ok(id)) => self.clean(sys, id).await?,
            }
        }
    }

    /// Migrates a frame to `dest`, which must lie on the same backing
    /// chain. If `dest` already holds a (newer) copy of the page, this
    /// frame is discarded instead: unpinned, cleaned if dirty, and freed.
    /// The frame must not be busy.
    pub async fn migrate(
        &self,
        sys: &Arc<MemSystem>,
        id: FrameId,
        dest: &Arc<MemObj>,
    ) -> SysResult<()> {
        let (src_owner, pagenum) = {
            let inner = self.inner.lock();
            let slot = inner.slot(id);
            debug_assert!(!slot.flags.contains(FrameFlags::BUSY), "migrating a busy frame");
            (slot.owner.upgrade(), slot.pagenum)
        };
        let dest_has_page = {
            let inner = self.inner.lock();
            inner.hash.contains_key(&(dest.id(), pagenum))
        };
        if dest_has_page {
            while self.pin_count(id) > 0 {
                self.unpin(id);
            }
            if self.is_dirty(id) {
                self.clean(sys, id).await?;
            }
            self.free(sys, id);
        } else {
            // Relink the frame's identity in one atomic block.
            {
                let mut inner = self.inner.lock();
                let old = {
                    let slot = inner.slot_mut(id);
                    let old = (slot.owner_id, slot.pagenum);
                    slot.owner = Arc::downgrade(dest);
                    slot.owner_id = dest.id();
                    old
                };
                inner.hash.remove(&old);
                inner.hash.insert((dest.id(), pagenum), id);
            }
            if let Some(src) = src_owner {
                src.note_resident_remove(id);
            }
            dest.note_resident_insert(id);
        }
        Ok(())
    }

    /// Removes every page-table entry that maps this frame, walking the
    /// areas registered on the bottom object of the owner's backing chain.
    pub fn remove_from_page_tables(&self, sys: &MemSystem, id: FrameId) {
        let (owner, pagenum) = {
            let inner = self.inner.lock();
            let slot = inner.slot(id);
            (slot.owner.upgrade(), slot.pagenum)
        };
        let Some(owner) = owner else { return };
        let bottom = owner.bottom_object();
        bottom.with_bindings(|binding| {
            if let Some(space) = binding.space.upgrade() {
                space.unmap_frame_of_area(sys, binding.area, pagenum);
            }
        });
    }

    /// Frees every resident frame of a dying object. No page tables can map
    /// them: nothing references the object any more.
    pub(crate) fn release_object_frames(&self, obj: &MemObj) {
        for id in obj.resident_frames() {
            let ppn = {
                let mut inner = self.inner.lock();
                let Some(slot) = inner.slots.get(id).and_then(|s| s.as_ref()) else {
                    continue;
                };
                if slot.owner_id != obj.id() {
                    continue;
                }
                debug_assert!(!slot.flags.contains(FrameFlags::BUSY));
                let sel = inner.sel_of(id);
                inner.unlink(sel, id);
                let slot = inner.slots[id].take().expect("stale frame id");
                inner.hash.remove(&(slot.owner_id, slot.pagenum));
                inner.recycled.push(id);
                slot.ppn
            };
            self.frames.free_one(ppn);
        }
    }

    /// What the pageout daemon should do next, looking at the head of the
    /// allocated list. `None` when the list is empty.
    pub(crate) fn evict_candidate(&self) -> Option<EvictStep> {
        let inner = self.inner.lock();
        let id = inner.allocated.head?;
        let slot = inner.slot(id);
        Some(if slot.flags.contains(FrameFlags::BUSY) {
            EvictStep::Busy(slot.waitq.clone())
        } else if slot.flags.contains(FrameFlags::DIRTY) {
            EvictStep::Clean(id)
        } else {
            EvictStep::Free(id)
        })
    }

    /// Rotates a frame to the tail of the allocated list; the daemon uses
    /// this to skip a frame whose cleaning keeps failing.
    pub(crate) fn requeue(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.slots.get(id).is_some_and(|s| s.is_some()) {
            inner.touch(id);
        }
    }

    pub fn frame_ppn(&self, id: FrameId) -> PhysPageNum {
        self.inner.lock().slot(id).ppn
    }

    /// The frame's identity: owning object and page number.
    pub fn frame_identity(&self, id: FrameId) -> (ObjId, usize) {
        let inner = self.inner.lock();
        let slot = inner.slot(id);
        (slot.owner_id, slot.pagenum)
    }

    pub fn is_dirty(&self, id: FrameId) -> bool {
        self.inner.lock().slot(id).flags.contains(FrameFlags::DIRTY)
    }

    pub fn pin_count(&self, id: FrameId) -> usize {
        self.inner.lock().slot(id).pin_count
    }

    /// Number of frames on the allocated (reclaimable) list.
    pub fn allocated_count(&self) -> usize {
        self.inner.lock().allocated.len
    }

    /// Number of pinned frames.
    pub fn pinned_count(&self) -> usize {
        self.inner.lock().pinned.len
    }

    /// Free frames remaining in the page allocator's pool.
    pub fn free_page_count(&self) -> usize {
        self.frames.free_count()
    }

    /// Checks the cache's structural invariants; used by tests at quiescent
    /// points.
    pub fn check_invariants(&self) {
        let inner = self.inner.lock();
        let mut on_lists = 0;
        for list in [&inner.allocated, &inner.pinned] {
            let mut cursor = list.head;
            let mut count = 0;
            while let Some(id) = cursor {
                let slot = inner.slot(id);
                let pinned = slot.pin_count > 0;
                assert_eq!(pinned, core::ptr::eq(list, &inner.pinned));
                count += 1;
                cursor = slot.next;
            }
            assert_eq!(count, list.len);
            on_lists += count;
        }
        let live = inner.slots.iter().filter(|s| s.is_some()).count();
        assert_eq!(on_lists, live, "every live frame is on exactly one list");
        assert_eq!(inner.hash.len(), live, "every live frame is hashed");
    }
}
