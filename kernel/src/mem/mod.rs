mod frame_allocator;

pub use frame_allocator::{CoreMapEntry, PagePool, Placement};

use core::fmt;
use core::ptr::NonNull;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// The contiguous region of physical memory handed out as user frames,
/// addressed through its kernel mapping.
#[derive(Clone, Copy)]
pub struct PhysicalMemory {
    base: NonNull<u8>,
    frames: usize,
}

// SAFETY: PhysicalMemory is only an address range; all access to the bytes
// goes through `Frame`, whose callers uphold exclusive access.
unsafe impl Send for PhysicalMemory {}
unsafe impl Sync for PhysicalMemory {}

impl PhysicalMemory {
    /// # Safety
    ///
    /// `base..base + frames * PAGE_FRAME_SIZE` must be valid, writable memory
    /// owned by the caller for as long as any derived `Frame` is in use.
    pub const unsafe fn new(base: NonNull<u8>, frames: usize) -> Self {
        Self { base, frames }
    }

    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// The frame with index `number`, if it lies inside this region.
    pub fn frame(&self, number: usize) -> Option<Frame> {
        if number >= self.frames {
            return None;
        }
        Some(Frame {
            number,
            // SAFETY: number < frames, so the offset stays inside the region.
            base: unsafe { self.base.add(number * PAGE_FRAME_SIZE) },
        })
    }
}

/// A handle to one physical frame.
///
/// Reading or writing the contents is `unsafe`: the caller must know nothing
/// else is touching the frame, i.e. it owns the page's state lock and the page
/// is pinned or not yet published in the frame table.
#[derive(Clone, Copy)]
pub struct Frame {
    number: usize,
    base: NonNull<u8>,
}

// SAFETY: see `PhysicalMemory`.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn kernel_address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Copies `src` into the frame at `offset`.
    ///
    /// # Safety
    ///
    /// No other reference to this frame's contents may be live.
    pub unsafe fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= PAGE_FRAME_SIZE);
        core::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
    }

    /// Copies bytes starting at `offset` into `dst`.
    ///
    /// # Safety
    ///
    /// No mutable reference to this frame's contents may be live.
    pub unsafe fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= PAGE_FRAME_SIZE);
        core::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
    }

    /// Zeroes the frame from `offset` to its end.
    ///
    /// # Safety
    ///
    /// Same as [`Frame::write`].
    pub unsafe fn zero_from(&self, offset: usize) {
        assert!(offset <= PAGE_FRAME_SIZE);
        self.base
            .as_ptr()
            .add(offset)
            .write_bytes(0, PAGE_FRAME_SIZE - offset);
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.number)
    }
}
