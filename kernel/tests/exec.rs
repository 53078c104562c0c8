//! The program loader: image construction, argument marshalling, the
//! interpreter path, format policing, and commit atomicity.

mod common;

use std::sync::Arc;

use common::*;

use executor::block_on;
use kernel::runtime::MemSystem;
use kernel::task::Process;
use kernel::vm::elf::do_execve;
use kernel::vm::uaccess::{copy_from_user, read_user_u32};
use systype::SysError;

async fn read_u32(sys: &Arc<MemSystem>, proc: &Arc<Process>, addr: usize) -> u32 {
    read_user_u32(sys, proc, addr).await.unwrap()
}

async fn read_cstr(sys: &Arc<MemSystem>, proc: &Arc<Process>, addr: usize) -> String {
    let mut out = Vec::new();
    let mut cur = addr;
    loop {
        let mut byte = [0u8; 1];
        copy_from_user(sys, proc, &mut byte, cur).await.unwrap();
        if byte[0] == 0 {
            break;
        }
        out.push(byte[0]);
        cur += 1;
    }
    String::from_utf8(out).unwrap()
}

fn simple_program() -> Vec<u8> {
    build_elf(
        ET_EXEC,
        0x0804_8010,
        &[
            Seg {
                vaddr: 0x0804_8000,
                data: vec![0x90; 128],
                memsz: 128,
                flags: PF_R | PF_X,
            },
            // Four initialised bytes, a page of memory: the data/BSS
            // boundary falls mid-page.
            Seg {
                vaddr: 0x0804_9000,
                data: b"DATA".to_vec(),
                memsz: 0x1000,
                flags: PF_R | PF_W,
            },
        ],
        None,
    )
}

#[test]
fn static_exec_builds_the_documented_image() {
    let (sys, fs) = boot(512);
    block_on(async {
        fs.create("/bin/prog", simple_program());
        let proc = Process::spawn(&sys, "init").unwrap();
        let argv = vec!["prog".to_string(), "one".to_string()];
        let envp = vec!["TERM=vt100".to_string()];
        let regs = do_execve(&sys, &proc, "/bin/prog", &argv, &envp)
            .await
            .unwrap();

        assert_eq!(regs.entry, 0x0804_8010);
        assert_eq!(proc.name(), "/bin/prog");
        assert_eq!(proc.regs().ip, regs.entry);
        assert_eq!(proc.regs().ret, 0);

        // brk == start_brk == first page above the loaded image.
        let brk = proc.brk_range();
        assert_eq!(brk.start, 0x0804_a000);
        assert_eq!(brk.brk, brk.start);

        // The stack image: argc, then the three vector pointers, then the
        // vectors, whose entries point at the strings.
        let arglow = regs.sp + 4;
        assert_eq!(read_u32(&sys, &proc, arglow).await, 2);
        let argv_ptr = read_u32(&sys, &proc, arglow + 4).await as usize;
        let envp_ptr = read_u32(&sys, &proc, arglow + 8).await as usize;
        let auxv_ptr = read_u32(&sys, &proc, arglow + 12).await as usize;

        let arg0 = read_u32(&sys, &proc, argv_ptr).await as usize;
        assert_eq!(read_cstr(&sys, &proc, arg0).await, "prog");
        let arg1 = read_u32(&sys, &proc, argv_ptr + 4).await as usize;
        assert_eq!(read_cstr(&sys, &proc, arg1).await, "one");
        assert_eq!(read_u32(&sys, &proc, argv_ptr + 8).await, 0);

        let env0 = read_user_u32(&sys, &proc, envp_ptr).await.unwrap() as usize;
        assert_eq!(read_cstr(&sys, &proc, env0).await, "TERM=vt100");
        assert_eq!(read_u32(&sys, &proc, envp_ptr + 4).await, 0);

        // No interpreter: the aux vector is a bare terminator.
        assert_eq!(read_u32(&sys, &proc, auxv_ptr).await, 0);

        // The BSS boundary is byte-exact: data bytes, then zeros.
        let mut buf = [0xAAu8; 8];
        copy_from_user(&sys, &proc, &mut buf, 0x0804_9000).await.unwrap();
        assert_eq!(&buf, b"DATA\0\0\0\0");

        // The guard page under the stack is inaccessible.
        let guard = 0x0804_8000 - (56 * 1024) - PAGE;
        let mut byte = [0u8; 1];
        assert_eq!(
            copy_from_user(&sys, &proc, &mut byte, guard).await,
            Err(SysError::EFAULT)
        );
    });
}

#[test]
fn exec_with_interpreter_relocates_entry_and_builds_auxv() {
    let (sys, fs) = boot(512);
    block_on(async {
        let prog = build_elf(
            ET_EXEC,
            0x0804_8000,
            &[Seg {
                vaddr: 0x0804_8000,
                data: vec![1; 32],
                memsz: 32,
                flags: PF_R | PF_X,
            }],
            Some("/lib/ld"),
        );
        fs.create("/bin/dyn", prog);
        let interp = build_elf(
            ET_DYN,
            0x40,
            &[Seg {
                vaddr: 0,
                data: vec![2; 64],
                memsz: 0x2000,
                flags: PF_R | PF_X,
            }],
            None,
        );
        fs.create("/lib/ld", interp);

        let proc = Process::spawn(&sys, "init").unwrap();
        let regs = do_execve(&sys, &proc, "/bin/dyn", &[], &[]).await.unwrap();

        // The aux vector names the program's own entry and headers; the
        // process starts in the interpreter instead.
        let arglow = regs.sp + 4;
        let auxv_ptr = read_u32(&sys, &proc, arglow + 12).await as usize;
        let mut auxv = std::collections::BTreeMap::new();
        let mut cur = auxv_ptr;
        loop {
            let a_type = read_u32(&sys, &proc, cur).await;
            if a_type == 0 {
                break;
            }
            let a_val = read_u32(&sys, &proc, cur + 4).await;
            auxv.insert(a_type, a_val);
            cur += 8;
        }
        assert_eq!(auxv[&4], 32); // AT_PHENT
        assert_eq!(auxv[&6], PAGE as u32); // AT_PAGESZ
        assert_eq!(auxv[&9], 0x0804_8000); // AT_ENTRY: the program's own
        let base = auxv[&7] as usize; // AT_BASE
        assert_eq!(regs.entry, base + 0x40);
        assert!(base > 0x0804_8000, "interpreter sits above the program");

        // AT_PHDR points at an on-stack copy of the program header table.
        let phdr = auxv[&3] as usize;
        let phnum = auxv[&5] as usize;
        assert_eq!(phnum, 2);
        let mut pht = vec![0u8; phnum * 32];
        copy_from_user(&sys, &proc, &mut pht, phdr).await.unwrap();
        // Entry 1 is the PT_LOAD segment of the program.
        let p_vaddr = u32::from_le_bytes(pht[32 + 8..32 + 12].try_into().unwrap());
        assert_eq!(p_vaddr, 0x0804_8000);

        // The interpreter's image is mapped at the chosen base.
        let mut buf = [0u8; 4];
        copy_from_user(&sys, &proc, &mut buf, base).await.unwrap();
        assert_eq!(buf, [2, 2, 2, 2]);
    });
}

#[test]
fn exec_failures_leave_the_caller_untouched() {
    let (sys, fs) = boot(512);
    block_on(async {
        fs.create("/bin/ok", simple_program());
        let proc = Process::spawn(&sys, "stable").unwrap();
        do_execve(&sys, &proc, "/bin/ok", &[], &[]).await.unwrap();
        let space_before = proc.space();
        let name_before = proc.name();
        let brk_before = proc.brk_range();

        // Missing file.
        assert_eq!(
            do_execve(&sys, &proc, "/missing", &[], &[]).await,
            Err(SysError::ENOENT)
        );

        // Overlapping PT_LOAD segments.
        let overlapping = build_elf(
            ET_EXEC,
            0x0804_8000,
            &[
                Seg {
                    vaddr: 0x0804_8000,
                    data: vec![0; 32],
                    memsz: 32,
                    flags: PF_R,
                },
                Seg {
                    vaddr: 0x0804_8000,
                    data: vec![0; 32],
                    memsz: 32,
                    flags: PF_R,
                },
            ],
            None,
        );
        fs.create("/bin/overlap", overlapping);
        assert_eq!(
            do_execve(&sys, &proc, "/bin/overlap", &[], &[]).await,
            Err(SysError::ENOEXEC)
        );

        // Bad magic.
        fs.create("/bin/junk", vec![0u8; 128]);
        assert_eq!(
            do_execve(&sys, &proc, "/bin/junk", &[], &[]).await,
            Err(SysError::ENOEXEC)
        );

        // Directories and devices are not executable.
        fs.create_kind("/dir", Vec::new(), kernel::fs::VnodeKind::Directory);
        assert_eq!(
            do_execve(&sys, &proc, "/dir", &[], &[]).await,
            Err(SysError::EISDIR)
        );
        fs.create_kind("/dev/null", Vec::new(), kernel::fs::VnodeKind::Device);
        assert_eq!(
            do_execve(&sys, &proc, "/dev/null", &[], &[]).await,
            Err(SysError::EACCES)
        );

        // The caller's image survived every failure.
        assert!(Arc::ptr_eq(&space_before, &proc.space()));
        assert_eq!(proc.name(), name_before);
        assert_eq!(proc.brk_range().start, brk_before.start);
    });
}

#[test]
fn exec_rejects_malformed_segments() {
    let (sys, fs) = boot(512);
    block_on(async {
        let proc = Process::spawn(&sys, "picky").unwrap();

        // Wrong segment alignment.
        let misaligned = build_elf_with(
            ET_EXEC,
            0x0804_8000,
            &[Seg {
                vaddr: 0x0804_8000,
                data: vec![0; 32],
                memsz: 32,
                flags: PF_R,
            }],
            None,
            8,
        );
        fs.create("/bin/align", misaligned);
        assert_eq!(
            do_execve(&sys, &proc, "/bin/align", &[], &[]).await,
            Err(SysError::ENOEXEC)
        );

        // vaddr and offset disagree modulo the page size.
        let mut skewed = build_elf(
            ET_EXEC,
            0x0804_8000,
            &[Seg {
                vaddr: 0x0804_8000,
                data: vec![0; 32],
                memsz: 32,
                flags: PF_R,
            }],
            None,
        );
        // Patch p_vaddr of the only program header.
        let vaddr_off = 52 + 8;
        let skewed_vaddr = 0x0804_8004u32;
        skewed[vaddr_off..vaddr_off + 4].copy_from_slice(&skewed_vaddr.to_le_bytes());
        fs.create("/bin/skew", skewed);
        assert_eq!(
            do_execve(&sys, &proc, "/bin/skew", &[], &[]).await,
            Err(SysError::ENOEXEC)
        );

        // filesz greater than memsz.
        let mut shrunk = build_elf(
            ET_EXEC,
            0x0804_8000,
            &[Seg {
                vaddr: 0x0804_8000,
                data: vec![0; 64],
                memsz: 64,
                flags: PF_R,
            }],
            None,
        );
        let memsz_off = 52 + 20;
        patch_memsz(&mut shrunk, memsz_off);
        fs.create("/bin/shrunk", shrunk);
        assert_eq!(
            do_execve(&sys, &proc, "/bin/shrunk", &[], &[]).await,
            Err(SysError::ENOEXEC)
        );

        // A program (not an interpreter) must be ET_EXEC.
        let pie = build_elf(
            ET_DYN,
            0x1000,
            &[Seg {
                vaddr: 0x1000,
                data: vec![0; 32],
                memsz: 32,
                flags: PF_R,
            }],
            None,
        );
        fs.create("/bin/pie", pie);
        assert_eq!(
            do_execve(&sys, &proc, "/bin/pie", &[], &[]).await,
            Err(SysError::ENOEXEC)
        );
    });
}

fn patch_memsz(image: &mut [u8], off: usize) {
    image[off..off + 4].copy_from_slice(&16u32.to_le_bytes());
}

#[test]
fn exec_argument_image_size_boundary() {
    // With one argument string of length L and no environment, the image
    // occupies L + 37 bytes; the stack holds strictly less than its size.
    let stack = 56 * 1024;
    let (sys, fs) = boot(512);
    block_on(async {
        fs.create("/bin/prog", simple_program());

        let proc = Process::spawn(&sys, "big").unwrap();
        let too_big = vec!["x".repeat(stack - 37)];
        assert_eq!(
            do_execve(&sys, &proc, "/bin/prog", &too_big, &[]).await,
            Err(SysError::E2BIG)
        );

        let just_fits = vec!["x".repeat(stack - 38)];
        let regs = do_execve(&sys, &proc, "/bin/prog", &just_fits, &[])
            .await
            .unwrap();
        assert_eq!(read_user_u32(&sys, &proc, regs.sp + 4).await.unwrap(), 1);
    });
}
