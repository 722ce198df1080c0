use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address. User stacks
// grow down from here.
pub const OFFSET: usize = 0x80000000;

// User stacks may not grow past this many bytes below OFFSET.
pub const MAX_STACK_SIZE: usize = 8 * MB;

// PUSHA writes 32 bytes below the stack pointer before it moves, so a fault
// that far below esp is still a legitimate stack access.
pub const STACK_HEURISTIC: usize = 32;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    page_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_address(addr: usize) -> bool {
    addr < OFFSET
}
