use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Number of swap device sectors backing one page.
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

/// User stacks grow down from just below kernel space.
pub const USER_STACK_TOP: usize = OFFSET;

/// The stack may not grow beyond this many bytes below `USER_STACK_TOP`.
pub const MAX_STACK_SIZE: usize = MB;

/// `push` on x86 writes one word below the stack pointer before moving it, so
/// a fault that far below `esp` is still a legitimate stack access.
pub const STACK_WORD_SIZE: usize = 4;

// TODO: Size the user pool from the multiboot memory map once the VM is wired
// into boot instead of using a fixed count.
pub const USER_POOL_FRAMES: usize = 1024;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_kernel_address(addr: usize) -> bool {
    addr >= OFFSET
}

/// Lowest address the user stack may grow down to.
#[inline]
pub const fn stack_limit() -> usize {
    USER_STACK_TOP - MAX_STACK_SIZE
}
