//! The ELF program-image loader.
//!
//! Loads 32-bit little-endian executables for the single machine target,
//! building a fresh address space: file-backed private mappings for the
//! initialised part of each `PT_LOAD` segment, anonymous-zero mappings for
//! the BSS tail (with the sub-page boundary hand-read from the file so it
//! is byte-exact), an optional interpreter image placed downward from the
//! top of user space, a fixed-size stack with a guard page below the
//! program, and the argument image marshalled in a kernel buffer and
//! written through the normal map-write path.
//!
//! Until the commit step at the very end, any failure destroys only the
//! new address space; the calling process's image is untouched. From the
//! commit on, nothing can fail.

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use elf::{ElfBytes, abi, endian::LittleEndian, file::Class, segment::ProgramHeader};

use config::mm::{DEFAULT_STACK_SIZE, PAGE_SIZE, USER_PTR_MASK, USER_PTR_SIZE};
use mm::address::{VirtPageNum, page_align_down, page_align_up, page_aligned};
use systype::{
    SysError, SysResult,
    memory_flags::{MemPerm, MmapFlags},
};

use crate::{
    fs::{Vnode, VnodeKind},
    runtime::MemSystem,
    task::{Process, TrapFrame},
    vm::addr_space::{AddrSpace, AllocDir},
};

/// Where the new image begins execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecImage {
    pub entry: usize,
    pub sp: usize,
}

/// One auxiliary-vector entry of the 32-bit target.
#[derive(Debug, Clone, Copy)]
struct AuxEntry {
    a_type: u32,
    a_val: u32,
}

const AT_NULL: u32 = 0;
const AT_PHDR: u32 = 3;
const AT_PHENT: u32 = 4;
const AT_PHNUM: u32 = 5;
const AT_PAGESZ: u32 = 6;
const AT_BASE: u32 = 7;
const AT_ENTRY: u32 = 9;

const AUX_ENTRY_SIZE: usize = 2 * USER_PTR_SIZE;
/// Size of an ELF32 file header.
const EHDR_SIZE: usize = 52;
/// Size of an ELF32 program header entry.
const PHENT_SIZE: usize = 32;

/// A parsed ELF file: the fields the loader needs plus the raw program
/// header table (a copy of which may go on the user stack as `AT_PHDR`).
struct LoadedElf {
    entry: usize,
    phdrs: Vec<ProgramHeader>,
    pht: Vec<u8>,
    phentsize: u16,
    phnum: u16,
}

/// Replaces the calling process's image with the program at `path`.
///
/// On success the process's address space, break, name and saved registers
/// all describe the new image, and the returned [`ExecImage`] tells the
/// trampoline where to resume. On failure the old image is intact.
pub async fn do_execve(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    path: &str,
    argv: &[String],
    envp: &[String],
) -> SysResult<ExecImage> {
    let vnode = sys.vfs.open(path).await?;
    match vnode.kind() {
        VnodeKind::Regular => {}
        VnodeKind::Directory => return Err(SysError::EISDIR),
        _ => return Err(SysError::EACCES),
    }

    let exe = load_elf_file(&vnode, false).await?;
    let map = AddrSpace::build(sys)?;

    let mut loadcount = 0;
    for ph in exe.phdrs.iter().filter(|ph| ph.p_type == abi::PT_LOAD) {
        map_segment(sys, &map, &vnode, 0, ph).await?;
        loadcount += 1;
    }
    if loadcount == 0 {
        log::debug!("exec {path}: no loadable segments");
        return Err(SysError::ENOEXEC);
    }
    let (proglow, proghigh) = prog_bounds(&exe.phdrs).ok_or(SysError::ENOEXEC)?;
    let mut entry = exe.entry;

    // Load the interpreter, if the program names one.
    let mut auxv: Vec<AuxEntry> = Vec::new();
    if let Some(interp_ph) = find_interp(&exe.phdrs)? {
        let interp_path = read_interp_path(&vnode, interp_ph).await?;
        log::debug!("exec {path}: interpreter {interp_path}");
        let ivnode = sys.vfs.open(&interp_path).await?;
        if ivnode.kind() != VnodeKind::Regular {
            return Err(SysError::EACCES);
        }
        let interp = load_elf_file(&ivnode, true).await?;
        // An interpreter asking for an interpreter is not serviced.
        if find_interp(&interp.phdrs)?.is_some() {
            return Err(SysError::EINVAL);
        }
        let (ilow, ihigh) = prog_bounds(&interp.phdrs).ok_or(SysError::ENOEXEC)?;
        let npages = page_align_up(ihigh) / PAGE_SIZE - ilow / PAGE_SIZE;
        let base_pn = map
            .find_range(npages, AllocDir::HighToLow)
            .ok_or(SysError::ENOMEM)?;
        let base = base_pn.address().to_usize() + (ilow % PAGE_SIZE);
        let memoff = base_pn.to_usize() as isize - (ilow / PAGE_SIZE) as isize;
        entry = base + (interp.entry - ilow);
        for ph in interp.phdrs.iter().filter(|ph| ph.p_type == abi::PT_LOAD) {
            map_segment(sys, &map, &ivnode, memoff, ph).await?;
        }
        auxv = vec![
            AuxEntry { a_type: AT_PHDR, a_val: 0 }, // patched to the on-stack copy
            AuxEntry { a_type: AT_PHENT, a_val: exe.phentsize as u32 },
            AuxEntry { a_type: AT_PHNUM, a_val: exe.phnum as u32 },
            AuxEntry { a_type: AT_ENTRY, a_val: exe.entry as u32 },
            AuxEntry { a_type: AT_BASE, a_val: base as u32 },
            AuxEntry { a_type: AT_PAGESZ, a_val: PAGE_SIZE as u32 },
        ];
    }

    // The stack sits immediately below the lowest loaded program address,
    // with one inaccessible guard page under it.
    let stack_npages = DEFAULT_STACK_SIZE / PAGE_SIZE;
    let proglow_pn = proglow / PAGE_SIZE;
    if proglow_pn < stack_npages + 1 {
        return Err(SysError::ENOMEM);
    }
    let stack_lo = VirtPageNum::new(proglow_pn - stack_npages);
    map.map(
        sys,
        None,
        Some(stack_lo),
        stack_npages,
        MemPerm::R | MemPerm::W,
        MmapFlags::MAP_PRIVATE | MmapFlags::MAP_FIXED,
        0,
        AllocDir::LowToHigh,
    )?;
    map.map(
        sys,
        None,
        Some(VirtPageNum::new(proglow_pn - stack_npages - 1)),
        1,
        MemPerm::empty(),
        MmapFlags::MAP_PRIVATE | MmapFlags::MAP_FIXED,
        0,
        AllocDir::LowToHigh,
    )?;

    // Marshal the argument image and write it just below the program.
    let argsize = calc_argsize(argv, envp, &auxv, exe.pht.len());
    if argsize >= DEFAULT_STACK_SIZE {
        return Err(SysError::E2BIG);
    }
    let arglow = (proglow - argsize) & !USER_PTR_MASK;
    let image = build_arg_image(arglow, argv, envp, &auxv, &exe.pht);
    map.write(sys, arglow, &image).await?;

    // The point of no return: swap in the new image. Nothing below fails.
    let start_brk = page_align_up(proghigh);
    let old_space = proc.swap_space(Arc::clone(&map));
    sys.activate(&map);
    sys.tlb.flush_all();
    proc.reset_brk(start_brk);
    proc.set_name(path);
    // Leave room for the (garbage) return address the entry code expects.
    let regs = ExecImage {
        entry,
        sp: arglow - USER_PTR_SIZE,
    };
    proc.set_regs(TrapFrame {
        ip: regs.entry,
        sp: regs.sp,
        ret: 0,
    });
    drop(old_space);
    log::info!(
        "exec {path}: entry {:#x} sp {:#x} brk {start_brk:#x}",
        regs.entry,
        regs.sp
    );
    Ok(regs)
}

/// Reads and validates an ELF file's header and program header table.
async fn load_elf_file(vnode: &Arc<dyn Vnode>, interp: bool) -> SysResult<LoadedElf> {
    // Bootstrap: pull the raw header to size the real read. The full
    // validation happens on the complete parse below.
    let mut hdr = [0u8; EHDR_SIZE];
    let n = vnode.read_at(0, &mut hdr).await?;
    if n < EHDR_SIZE || hdr[..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(SysError::ENOEXEC);
    }
    let phoff = u32::from_le_bytes(hdr[28..32].try_into().unwrap()) as usize;
    let phentsize = u16::from_le_bytes(hdr[42..44].try_into().unwrap());
    let phnum = u16::from_le_bytes(hdr[44..46].try_into().unwrap());
    if phentsize as usize != PHENT_SIZE || phnum == 0 || phnum > 512 {
        return Err(SysError::ENOEXEC);
    }
    if phoff < EHDR_SIZE || phoff > (1 << 20) {
        return Err(SysError::ENOEXEC);
    }

    let phtsize = phnum as usize * PHENT_SIZE;
    let mut buf = vec![0u8; phoff + phtsize];
    let n = vnode.read_at(0, &mut buf).await?;
    if n < buf.len() {
        return Err(SysError::ENOEXEC);
    }
    let elf = ElfBytes::<LittleEndian>::minimal_parse(&buf).map_err(|_| SysError::ENOEXEC)?;

    if elf.ehdr.class != Class::ELF32 {
        return Err(SysError::ENOEXEC);
    }
    if elf.ehdr.e_machine != abi::EM_386 {
        return Err(SysError::ENOEXEC);
    }
    // Interpreters may be position-independent; programs must not be.
    if elf.ehdr.e_type != abi::ET_EXEC && !(elf.ehdr.e_type == abi::ET_DYN && interp) {
        return Err(SysError::ENOEXEC);
    }

    let phdrs: Vec<ProgramHeader> = elf
        .segments()
        .ok_or(SysError::ENOEXEC)?
        .iter()
        .collect();
    Ok(LoadedElf {
        entry: elf.ehdr.e_entry as usize,
        phdrs,
        pht: buf[phoff..phoff + phtsize].to_vec(),
        phentsize,
        phnum,
    })
}

/// Maps one `PT_LOAD` segment, displaced by `memoff` pages: the initialised
/// part from the file, the rest anonymous-zero, with the sub-page boundary
/// between them read in by hand so the BSS begins exactly at `p_filesz`.
async fn map_segment(
    sys: &Arc<MemSystem>,
    map: &Arc<AddrSpace>,
    vnode: &Arc<dyn Vnode>,
    memoff: isize,
    ph: &ProgramHeader,
) -> SysResult<()> {
    let addr = (ph.p_vaddr as isize + memoff * PAGE_SIZE as isize) as usize;
    let off = ph.p_offset as usize;
    let filesz = ph.p_filesz as usize;
    let memsz = ph.p_memsz as usize;

    log::debug!(
        "elf: segment vaddr {addr:#x} off {off:#x} filesz {filesz:#x} memsz {memsz:#x} flags {:#x}",
        ph.p_flags
    );

    if ph.p_align as usize != PAGE_SIZE {
        return Err(SysError::ENOEXEC);
    }
    if filesz > memsz {
        return Err(SysError::ENOEXEC);
    }
    if addr % PAGE_SIZE != off % PAGE_SIZE {
        return Err(SysError::ENOEXEC);
    }

    let mut perms = MemPerm::empty();
    if ph.p_flags & abi::PF_R != 0 {
        perms |= MemPerm::R;
    }
    if ph.p_flags & abi::PF_W != 0 {
        perms |= MemPerm::W;
    }
    if ph.p_flags & abi::PF_X != 0 {
        perms |= MemPerm::X;
    }

    if filesz > 0 {
        // Enough pages to cover all initialised bytes.
        let lopage = addr / PAGE_SIZE;
        let npages = (addr + filesz - 1) / PAGE_SIZE - lopage + 1;
        if !map.is_range_empty(VirtPageNum::new(lopage), npages) {
            log::debug!("elf: overlapping segments");
            return Err(SysError::ENOEXEC);
        }
        map.map(
            sys,
            Some(Arc::clone(vnode)),
            Some(VirtPageNum::new(lopage)),
            npages,
            perms,
            MmapFlags::MAP_PRIVATE | MmapFlags::MAP_FIXED,
            page_align_down(off) / PAGE_SIZE,
            AllocDir::LowToHigh,
        )?;
    }

    if memsz > filesz {
        // The zero-initialised tail. Its first page may coincide with the
        // last file-backed page; mapping it anonymously and re-reading the
        // partial data below keeps the data/BSS boundary byte-exact.
        let lopage = (addr + filesz) / PAGE_SIZE;
        let npages = page_align_up(addr + memsz) / PAGE_SIZE - lopage;
        if npages > 1 && !map.is_range_empty(VirtPageNum::new(lopage + 1), npages - 1) {
            log::debug!("elf: overlapping segments");
            return Err(SysError::ENOEXEC);
        }
        if npages > 0 {
            map.map(
                sys,
                None,
                Some(VirtPageNum::new(lopage)),
                npages,
                perms,
                MmapFlags::MAP_PRIVATE | MmapFlags::MAP_FIXED,
                0,
                AllocDir::LowToHigh,
            )?;
        }
        if !page_aligned(addr + filesz) && filesz > 0 {
            let tail = (addr + filesz) % PAGE_SIZE;
            let mut buf = vec![0u8; tail];
            let n = vnode.read_at(page_align_down(off + filesz), &mut buf).await?;
            map.write(sys, page_align_down(addr + filesz), &buf[..n]).await?;
        }
    }
    Ok(())
}

/// Finds the unique `PT_INTERP` entry, if any.
///
/// # Errors
/// `EINVAL` if there is more than one.
fn find_interp(phdrs: &[ProgramHeader]) -> SysResult<Option<&ProgramHeader>> {
    let mut found = None;
    for ph in phdrs.iter().filter(|ph| ph.p_type == abi::PT_INTERP) {
        if found.is_some() {
            log::debug!("elf: multiple interpreters");
            return Err(SysError::EINVAL);
        }
        found = Some(ph);
    }
    Ok(found)
}

async fn read_interp_path(vnode: &Arc<dyn Vnode>, ph: &ProgramHeader) -> SysResult<String> {
    let mut buf = vec![0u8; ph.p_filesz as usize];
    let n = vnode.read_at(ph.p_offset as usize, &mut buf).await?;
    if n != buf.len() {
        return Err(SysError::ENOEXEC);
    }
    while buf.last() == Some(&0) {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| SysError::ENOEXEC)
}

/// The lowest and highest (exclusive) virtual addresses the `PT_LOAD`
/// segments cover.
fn prog_bounds(phdrs: &[ProgramHeader]) -> Option<(usize, usize)> {
    let mut low = usize::MAX;
    let mut high = 0;
    for ph in phdrs.iter().filter(|ph| ph.p_type == abi::PT_LOAD) {
        low = low.min(ph.p_vaddr as usize);
        high = high.max((ph.p_vaddr + ph.p_memsz) as usize);
    }
    (low < high).then_some((low, high))
}

/// Total bytes the argument image occupies on the stack: `argc`, the three
/// vector pointers, the vectors themselves, every string, and, when
/// `AT_PHDR` is present, a copy of the program header table.
fn calc_argsize(argv: &[String], envp: &[String], auxv: &[AuxEntry], phtsize: usize) -> usize {
    let mut size = 0;
    for s in argv {
        size += s.len() + 1;
    }
    size += (argv.len() + 1) * USER_PTR_SIZE;
    for s in envp {
        size += s.len() + 1;
    }
    size += (envp.len() + 1) * USER_PTR_SIZE;
    if auxv.iter().any(|a| a.a_type == AT_PHDR) {
        size += phtsize;
    }
    size += (auxv.len() + 1) * AUX_ENTRY_SIZE;
    size += USER_PTR_SIZE; // argc
    size += 3 * USER_PTR_SIZE; // the argv, envp and auxv pointers
    size
}

/// Marshals the argument image in a kernel buffer. Every pointer stored in
/// the image is the user-space address its target will occupy once the
/// buffer is written at `arglow`.
fn build_arg_image(
    arglow: usize,
    argv: &[String],
    envp: &[String],
    auxv: &[AuxEntry],
    pht: &[u8],
) -> Vec<u8> {
    let argsize = calc_argsize(argv, envp, auxv, pht.len());
    let mut image = vec![0u8; argsize];

    let veclen =
        (argv.len() + 1 + envp.len() + 1) * USER_PTR_SIZE + (auxv.len() + 1) * AUX_ENTRY_SIZE;
    // Offsets within the image of the vector block and the string pool.
    let vecstart = USER_PTR_SIZE + 3 * USER_PTR_SIZE;
    let strstart = vecstart + veclen;

    let put = |image: &mut [u8], off: usize, val: u32| {
        image[off..off + 4].copy_from_slice(&val.to_le_bytes());
    };

    put(&mut image, 0, argv.len() as u32);
    put(&mut image, 4, (arglow + vecstart) as u32);
    put(
        &mut image,
        8,
        (arglow + vecstart + (argv.len() + 1) * USER_PTR_SIZE) as u32,
    );
    put(
        &mut image,
        12,
        (arglow + vecstart + (argv.len() + 1 + envp.len() + 1) * USER_PTR_SIZE) as u32,
    );

    let mut vec_off = vecstart;
    let mut str_off = strstart;
    for s in argv {
        put(&mut image, vec_off, (arglow + str_off) as u32);
        image[str_off..str_off + s.len()].copy_from_slice(s.as_bytes());
        str_off += s.len() + 1; // keep the NUL
        vec_off += USER_PTR_SIZE;
    }
    // argv's null terminator; the slot is already zero.
    vec_off += USER_PTR_SIZE;
    for s in envp {
        put(&mut image, vec_off, (arglow + str_off) as u32);
        image[str_off..str_off + s.len()].copy_from_slice(s.as_bytes());
        str_off += s.len() + 1;
        vec_off += USER_PTR_SIZE;
    }
    // envp's null terminator.
    vec_off += USER_PTR_SIZE;

    for aux in auxv {
        put(&mut image, vec_off, aux.a_type);
        let val = if aux.a_type == AT_PHDR {
            image[str_off..str_off + pht.len()].copy_from_slice(pht);
            let at = (arglow + str_off) as u32;
            str_off += pht.len();
            at
        } else {
            aux.a_val
        };
        put(&mut image, vec_off + 4, val);
        vec_off += AUX_ENTRY_SIZE;
    }
    put(&mut image, vec_off, AT_NULL);

    image
}
