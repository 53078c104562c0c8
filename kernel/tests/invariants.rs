//! Whole-system invariants at quiescent points, checked after a mixed
//! workload of mapping, faulting, forking and unmapping.

mod common;

use std::sync::Arc;

use common::*;

use executor::block_on;
use kernel::fs::{File, FileMode, Vnode};
use kernel::syscall::mm::{do_mmap, do_munmap};
use kernel::syscall::process::do_fork;
use kernel::task::Process;
use kernel::vm::fault::{FaultCause, FaultOutcome, handle_page_fault};
use kernel::vm::page_table::PteFlags;
use kernel::vm::uaccess::copy_to_user;
use mm::address::VirtPageNum;
use systype::memory_flags::{MemPerm, MmapFlags, MmapProt};

const RW: MmapProt = MmapProt::PROT_READ.union(MmapProt::PROT_WRITE);

/// Every present page-table entry's permissions are a subset of the
/// containing area's protection.
fn check_pt_within_areas(space: &kernel::vm::addr_space::AddrSpace) {
    for (vpn, _ppn, flags) in space.pt_entries() {
        let view = space.lookup(vpn).expect("a mapped page lies in some area");
        if flags.contains(PteFlags::WRITE) {
            assert!(view.prot.contains(MemPerm::W), "writable PTE in {vpn:?}");
        }
        if flags.contains(PteFlags::EXEC) {
            assert!(view.prot.contains(MemPerm::X), "executable PTE in {vpn:?}");
        }
        assert!(view.prot.contains(MemPerm::R), "readable PTE in {vpn:?}");
    }
}

/// Areas are pairwise disjoint and sorted by starting page.
fn check_areas_sorted(space: &kernel::vm::addr_space::AddrSpace) {
    let mut prev_end: Option<VirtPageNum> = None;
    space.for_each_area(|area| {
        if let Some(end) = prev_end {
            assert!(end <= area.start(), "areas overlap or are unsorted");
        }
        assert!(area.start() < area.end());
        prev_end = Some(area.end());
    });
}

#[test]
fn quiescent_invariants_after_mixed_workload() {
    let (sys, fs) = boot(256);
    block_on(async {
        let vnode = fs.create("/mix", vec![3u8; 8 * PAGE]);
        let parent = Process::spawn(&sys, "mixer").unwrap();
        let fd = parent
            .with_fds(|fds| {
                fds.install(File::new(
                    Arc::clone(&vnode) as Arc<dyn Vnode>,
                    FileMode::READ | FileMode::WRITE,
                ))
            })
            .unwrap();

        let filemap = do_mmap(&sys, &parent, 0, 8 * PAGE, RW, MmapFlags::MAP_SHARED, fd, 0)
            .unwrap();
        let anon = do_mmap(
            &sys,
            &parent,
            0,
            4 * PAGE,
            RW,
            MmapFlags::MAP_PRIVATE | MmapFlags::MAP_ANON,
            -1,
            0,
        )
        .unwrap();

        for i in 0..8 {
            copy_to_user(&sys, &parent, filemap + i * PAGE, &[i as u8]).await.unwrap();
        }
        copy_to_user(&sys, &parent, anon, &[1; 2 * PAGE]).await.unwrap();

        // Fault a few pages so page tables are populated.
        sys.activate(&parent.space());
        for addr in [filemap, anon, anon + PAGE] {
            assert_eq!(
                handle_page_fault(&sys, &parent, addr, FaultCause::USER | FaultCause::WRITE).await,
                FaultOutcome::Resumed
            );
        }

        let child = do_fork(&sys, &parent).unwrap();
        copy_to_user(&sys, &child, anon, &[2; 16]).await.unwrap();

        // Carve holes in both processes.
        do_munmap(&sys, &parent, filemap + 2 * PAGE, 2 * PAGE).unwrap();
        do_munmap(&sys, &child, anon + PAGE, PAGE).unwrap();

        // Quiescent now: nothing is suspended mid-operation.
        sys.cache.check_invariants();
        for proc in [&parent, &child] {
            let space = proc.space();
            check_areas_sorted(&space);
            check_pt_within_areas(&space);
        }

        // The file object is shared between the processes' mappings and
        // holds at most its mapped pages resident.
        let obj = parent
            .space()
            .lookup(mm::address::VirtAddr::new(filemap).page_number())
            .unwrap()
            .obj;
        assert!(obj.resident_count() <= 8);

        // Free count accounting: every frame is either free, allocated or
        // pinned.
        let used = sys.cache.allocated_count() + sys.cache.pinned_count();
        assert!(sys.cache.free_page_count() + used <= sys.frames.total_usable());

        sys.cache.check_invariants();
    });
}

#[test]
fn teardown_releases_every_frame() {
    let (sys, fs) = boot(128);
    block_on(async {
        let baseline = sys.cache.free_page_count();
        {
            let vnode = fs.create("/gone", vec![0u8; 2 * PAGE]);
            let proc = Process::spawn(&sys, "leaver").unwrap();
            let fd = proc
                .with_fds(|fds| {
                    fds.install(File::new(
                        Arc::clone(&vnode) as Arc<dyn Vnode>,
                        FileMode::READ | FileMode::WRITE,
                    ))
                })
                .unwrap();
            let anon = do_mmap(
                &sys,
                &proc,
                0,
                2 * PAGE,
                RW,
                MmapFlags::MAP_PRIVATE | MmapFlags::MAP_ANON,
                -1,
                0,
            )
            .unwrap();
            let fmap = do_mmap(&sys, &proc, 0, 2 * PAGE, RW, MmapFlags::MAP_SHARED, fd, 0)
                .unwrap();
            copy_to_user(&sys, &proc, anon, &[1; 64]).await.unwrap();
            copy_to_user(&sys, &proc, fmap, &[2; 64]).await.unwrap();
            // Destruction frees resident frames without writing them back;
            // flush the shared page before its object dies.
            sys.sync().await.unwrap();
            do_munmap(&sys, &proc, anon, 2 * PAGE).unwrap();
            do_munmap(&sys, &proc, fmap, 2 * PAGE).unwrap();
            sys.reap_process(proc.pid());
        }
        // Every object's last reference is gone: the anonymous and file
        // frames died with their objects, and the process's page table went
        // with the process. Nothing remains allocated.
        sys.cache.check_invariants();
        assert_eq!(sys.cache.free_page_count(), baseline);
        assert_eq!(sys.cache.allocated_count() + sys.cache.pinned_count(), 0);
        assert_eq!(&vnode_content(&fs).await[..8], &[2u8; 8]);
    });
}

/// Re-opens the test file and returns its contents, proving the sync above
/// reached the collaborator before the object died.
async fn vnode_content(fs: &RamFs) -> Vec<u8> {
    use kernel::fs::Vfs;
    let vnode = fs.open("/gone").await.unwrap();
    let mut buf = vec![0u8; vnode.len()];
    vnode.read_at(0, &mut buf).await.unwrap();
    buf
}
