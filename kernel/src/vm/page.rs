//! Per-page descriptors.

use super::{MapId, Pid, SwapSlot};
use crate::fs::{BackingFile, FILESYS_LOCK};
use crate::mem::Frame;
use crate::paging::PageManager;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// A run of file bytes backing one page, followed by zero fill.
#[derive(Clone)]
pub struct FileRegion {
    pub file: Arc<dyn BackingFile>,
    pub offset: usize,
    pub read_len: usize,
    pub zero_len: usize,
}

impl FileRegion {
    /// Fills `frame` from the file and zeroes the remainder. Returns false on
    /// a short read.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `frame`.
    pub(crate) unsafe fn load_into(&self, frame: &Frame) -> bool {
        let mut buf = [0u8; PAGE_FRAME_SIZE];
        let read = {
            let _fs = FILESYS_LOCK.lock();
            self.file.read_at(&mut buf[..self.read_len], self.offset)
        };
        if read != self.read_len {
            return false;
        }
        frame.write(0, &buf[..self.read_len]);
        frame.zero_from(self.read_len);
        true
    }

    /// Writes the file-backed prefix of `frame` back to the file. Returns the
    /// number of bytes written.
    ///
    /// # Safety
    ///
    /// Nothing may write to `frame` for the duration of the call.
    pub(crate) unsafe fn write_back(&self, frame: &Frame) -> usize {
        let mut buf = [0u8; PAGE_FRAME_SIZE];
        frame.read(0, &mut buf[..self.read_len]);
        let _fs = FILESYS_LOCK.lock();
        self.file.write_at(&buf[..self.read_len], self.offset)
    }
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion")
            .field("offset", &self.offset)
            .field("read_len", &self.read_len)
            .field("zero_len", &self.zero_len)
            .finish()
    }
}

/// Where a page's contents come from when it is not resident.
#[derive(Debug)]
pub enum Backing {
    /// Loaded from a program image. Becomes `Swap` the first time it is
    /// evicted dirty.
    Executable(FileRegion),
    /// Anonymous memory. `slot` is set while the contents live on swap; a page
    /// that was never swapped out is zero filled.
    Swap { slot: Option<SwapSlot> },
    /// Loaded from and written back to a mapped file.
    MemoryMapped { region: FileRegion, map_id: MapId },
}

impl Backing {
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self {
            Backing::Swap { slot } => *slot,
            _ => None,
        }
    }

    pub fn is_swap(&self) -> bool {
        matches!(self, Backing::Swap { .. })
    }
}

#[derive(Debug)]
pub struct PageState {
    pub(crate) backing: Backing,
    /// Set exactly when the page is resident.
    pub(crate) frame: Option<Frame>,
}

impl PageState {
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn frame(&self) -> Option<Frame> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }
}

pub struct Page {
    address: usize,
    writable: bool,
    pins: AtomicUsize,
    state: Mutex<PageState>,
}

impl Page {
    pub(crate) fn new(address: usize, writable: bool, backing: Backing) -> Arc<Self> {
        Arc::new(Self {
            address,
            writable,
            pins: AtomicUsize::new(0),
            state: Mutex::new(PageState {
                backing,
                frame: None,
            }),
        })
    }

    /// Page-aligned user virtual address.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Pinned pages are never chosen for eviction.
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub fn pin(self: &Arc<Self>) -> PinGuard {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard {
            page: Arc::clone(self),
        }
    }

    pub fn state(&self) -> MutexGuard<PageState> {
        self.state.lock()
    }

    pub(crate) fn try_state(&self) -> Option<MutexGuard<PageState>> {
        self.state.try_lock()
    }

    pub fn is_resident(&self) -> bool {
        self.state().is_resident()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("address", &format_args!("{:#x}", self.address))
            .field("writable", &self.writable)
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Keeps a page pinned until dropped.
#[must_use]
pub struct PinGuard {
    page: Arc<Page>,
}

impl PinGuard {
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.page.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The process a resident frame belongs to.
#[derive(Clone)]
pub struct Owner {
    pub pid: Pid,
    pub page_manager: Arc<Mutex<PageManager>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;
    use crate::mem::{PagePool, Placement};

    #[test]
    fn pins_nest() {
        let page = Page::new(0x1000, true, Backing::Swap { slot: None });
        assert!(!page.is_pinned());
        let a = page.pin();
        let b = page.pin();
        drop(a);
        assert!(page.is_pinned());
        drop(b);
        assert!(!page.is_pinned());
    }

    #[test]
    fn region_loads_prefix_then_zeros() {
        let mut pool = PagePool::new(1, Placement::FirstFit);
        let frame = pool.get_page(false).unwrap();
        unsafe { frame.write(0, &[0xaa; PAGE_FRAME_SIZE]) };

        let region = FileRegion {
            file: Arc::new(MemFile::new(vec![1, 2, 3, 4, 5, 6])),
            offset: 2,
            read_len: 3,
            zero_len: PAGE_FRAME_SIZE - 3,
        };
        assert!(unsafe { region.load_into(&frame) });

        let mut out = vec![0xffu8; PAGE_FRAME_SIZE];
        unsafe { frame.read(0, &mut out) };
        assert_eq!(&out[..3], &[3, 4, 5]);
        assert!(out[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn region_short_read_fails() {
        let mut pool = PagePool::new(1, Placement::FirstFit);
        let frame = pool.get_page(true).unwrap();
        let region = FileRegion {
            file: Arc::new(MemFile::new(vec![1, 2])),
            offset: 0,
            read_len: 10,
            zero_len: PAGE_FRAME_SIZE - 10,
        };
        assert!(!unsafe { region.load_into(&frame) });
    }
}
