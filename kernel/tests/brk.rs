//! Break management: growth, shrinkage, and the fault on a released page.

mod common;

use common::*;

use executor::block_on;
use kernel::syscall::mm::{do_brk, do_mmap};
use kernel::task::Process;
use kernel::vm::elf::do_execve;
use kernel::vm::fault::{FaultCause, FaultOutcome, handle_page_fault};
use kernel::vm::uaccess::{copy_from_user, copy_to_user};
use systype::SysError;
use systype::memory_flags::{MmapFlags, MmapProt};

const RW: MmapProt = MmapProt::PROT_READ.union(MmapProt::PROT_WRITE);

/// Boots, loads a one-segment program, and returns the process with its
/// image-defined initial break.
async fn exec_fixture(sys: &std::sync::Arc<kernel::runtime::MemSystem>, fs: &RamFs) -> std::sync::Arc<Process> {
    let image = build_elf(
        ET_EXEC,
        0x0804_8000,
        &[Seg {
            vaddr: 0x0804_8000,
            data: vec![0x90; 64],
            memsz: 64,
            flags: PF_R | PF_X,
        }],
        None,
    );
    fs.create("/bin/prog", image);
    let proc = Process::spawn(sys, "init").unwrap();
    do_execve(sys, &proc, "/bin/prog", &[], &[]).await.unwrap();
    proc
}

#[test]
fn brk_growth_and_shrinkage() {
    let (sys, fs) = boot(256);
    block_on(async {
        let proc = exec_fixture(&sys, &fs).await;
        let b = proc.brk_range().start;
        assert!(b > 0 && b % PAGE == 0);
        assert_eq!(do_brk(&sys, &proc, 0), Ok(b));

        // Grow by one page: the new page is writable memory.
        assert_eq!(do_brk(&sys, &proc, b + PAGE), Ok(b + PAGE));
        copy_to_user(&sys, &proc, b, &[0x42]).await.unwrap();
        let mut byte = [0u8; 1];
        copy_from_user(&sys, &proc, &mut byte, b).await.unwrap();
        assert_eq!(byte[0], 0x42);

        // Shrink back: the page is gone, and touching it kills the process.
        assert_eq!(do_brk(&sys, &proc, b), Ok(b));
        assert!(copy_from_user(&sys, &proc, &mut byte, b).await == Err(SysError::EFAULT));
        let outcome = handle_page_fault(&sys, &proc, b, FaultCause::USER).await;
        assert_eq!(outcome, FaultOutcome::Terminated(SysError::EFAULT));
    });
}

#[test]
fn brk_below_image_or_into_mappings_fails() {
    let (sys, fs) = boot(256);
    block_on(async {
        let proc = exec_fixture(&sys, &fs).await;
        let b = proc.brk_range().start;

        // Below the initial break.
        assert_eq!(do_brk(&sys, &proc, b - 1), Err(SysError::ENOMEM));

        // Growing over an existing mapping.
        let obstacle = b + 4 * PAGE;
        do_mmap(
            &sys,
            &proc,
            obstacle,
            PAGE,
            RW,
            MmapFlags::MAP_PRIVATE | MmapFlags::MAP_ANON | MmapFlags::MAP_FIXED,
            -1,
            0,
        )
        .unwrap();
        assert_eq!(do_brk(&sys, &proc, obstacle + PAGE), Err(SysError::ENOMEM));

        // The break is untouched by the failures.
        assert_eq!(do_brk(&sys, &proc, 0), Ok(b));
    });
}

#[test]
fn brk_without_an_image_fails() {
    let (sys, _fs) = boot(64);
    let proc = Process::spawn(&sys, "bare").unwrap();
    assert_eq!(do_brk(&sys, &proc, 0x1000_0000), Err(SysError::ENOMEM));
}

#[test]
fn brk_sub_page_moves_track_byte_values() {
    let (sys, fs) = boot(256);
    block_on(async {
        let proc = exec_fixture(&sys, &fs).await;
        let b = proc.brk_range().start;

        // Sub-page growth still maps a whole page and reports the byte
        // value back exactly.
        assert_eq!(do_brk(&sys, &proc, b + 100), Ok(b + 100));
        assert_eq!(do_brk(&sys, &proc, 0), Ok(b + 100));
        copy_to_user(&sys, &proc, b + 99, &[1]).await.unwrap();

        // Growing within the same page allocates nothing new.
        assert_eq!(do_brk(&sys, &proc, b + 200), Ok(b + 200));
        copy_to_user(&sys, &proc, b + 199, &[2]).await.unwrap();
    });
}
