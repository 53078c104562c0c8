//! Memory layout and paging parameters.

/// Size of a page frame in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Width of the in-page offset of an address.
pub const PAGE_SHIFT: usize = 12;

/// Lowest user-space virtual address (inclusive).
pub const USER_MEM_LOW: usize = 0x0040_0000;
/// Highest user-space virtual address (exclusive).
pub const USER_MEM_HIGH: usize = 0xc000_0000;

/// Size of a pointer on the user-visible 32-bit target, in bytes.
pub const USER_PTR_SIZE: usize = 4;
/// Alignment mask for user pointers.
pub const USER_PTR_MASK: usize = USER_PTR_SIZE - 1;

/// Size of the initial user stack mapped by the program loader.
pub const DEFAULT_STACK_SIZE: usize = 56 * 1024;

/// Number of installed page frames kept back for the kernel's small-object
/// allocator. These frames never enter the page allocator's pool.
pub const fn kernel_reserved_frames(installed: usize) -> usize {
    // 37.5%-ish
    (installed >> 2) + (installed >> 3)
}

/// Default low watermark of free frames below which the pageout daemon is
/// woken, as a share of the usable pool.
pub const fn pageout_free_min(usable: usize) -> usize {
    usable >> 4
}

/// Default number of free frames the pageout daemon tries to reach once
/// woken, as a share of the usable pool.
pub const fn pageout_free_target(usable: usize) -> usize {
    usable >> 3
}
