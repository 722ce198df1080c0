//! The global frame table. Every frame handed to a user page is recorded here
//! so it can be chosen for eviction by the clock algorithm.

use super::page::{Backing, Owner, Page};
use super::SwapManager;
use crate::mem::{Frame, PagePool, PhysicalMemory};
use crate::sync::mutex::Mutex;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::{debug, warn};

struct FrameEntry {
    frame: Frame,
    page: Weak<Page>,
    /// User address `frame` is mapped at in `owner`.
    address: usize,
    owner: Owner,
}

struct Inner {
    pool: PagePool,
    entries: Vec<FrameEntry>,
    /// Clock hand, an index into `entries`.
    hand: usize,
    /// Entries visited by the most recent eviction.
    last_scan: usize,
    evictions: usize,
}

enum Visit {
    Evicted,
    Skipped,
}

pub struct FrameTable {
    inner: Mutex<Inner>,
    memory: PhysicalMemory,
    swap: Arc<SwapManager>,
}

impl FrameTable {
    pub fn new(pool: PagePool, swap: Arc<SwapManager>) -> Self {
        let memory = pool.memory();
        Self {
            inner: Mutex::new(Inner {
                pool,
                entries: Vec::new(),
                hand: 0,
                last_scan: 0,
                evictions: 0,
            }),
            memory,
            swap,
        }
    }

    pub fn memory(&self) -> PhysicalMemory {
        self.memory
    }

    /// Allocates a frame for `page`, evicting another page if the pool is
    /// exhausted.
    ///
    /// Panics if every frame is pinned.
    pub fn acquire(&self, zero_fill: bool, page: &Arc<Page>, owner: &Owner) -> Frame {
        let mut inner = self.inner.lock();
        let frame = match inner.pool.get_page(zero_fill) {
            Some(frame) => frame,
            None => {
                inner.evict(&self.swap);
                let Some(frame) = inner.pool.get_page(zero_fill) else {
                    panic!("eviction did not free a frame");
                };
                frame
            }
        };

        // Newly loaded pages go behind the hand so they are visited last.
        let at = inner.hand;
        inner.entries.insert(
            at,
            FrameEntry {
                frame,
                page: Arc::downgrade(page),
                address: page.address(),
                owner: owner.clone(),
            },
        );
        inner.hand += 1;
        frame
    }

    /// Returns `frame` to the pool. Unknown frames are ignored.
    pub fn release(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.entries.iter().position(|e| e.frame == frame) {
            inner.remove_at(index);
        }
    }

    pub fn contains(&self, frame: Frame) -> bool {
        self.inner.lock().entries.iter().any(|e| e.frame == frame)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().pool.total_pages()
    }

    pub fn free_frames(&self) -> usize {
        let inner = self.inner.lock();
        inner.pool.total_pages() - inner.pool.allocated_pages()
    }

    pub fn last_scan_length(&self) -> usize {
        self.inner.lock().last_scan
    }

    pub fn evictions(&self) -> usize {
        self.inner.lock().evictions
    }
}

impl Inner {
    fn remove_at(&mut self, index: usize) {
        let entry = self.entries.remove(index);
        if index < self.hand {
            self.hand -= 1;
        }
        self.pool.free_page(entry.frame);
    }

    /// Frees one frame. The first pass over the table gives accessed pages a
    /// second chance; the second pass takes any unpinned page.
    fn evict(&mut self, swap: &SwapManager) {
        let len = self.entries.len();
        let mut visited = 0;
        loop {
            assert!(visited < 2 * len, "no evictable frame: all {len} frames are pinned");
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            visited += 1;
            match self.visit(self.hand, visited <= len, swap) {
                Visit::Evicted => break,
                Visit::Skipped => self.hand += 1,
            }
        }
        self.last_scan = visited;
        self.evictions += 1;
    }

    fn visit(&mut self, index: usize, second_chance: bool, swap: &SwapManager) -> Visit {
        let entry = &self.entries[index];
        let frame = entry.frame;
        let owner = entry.owner.clone();
        let Some(page) = entry.page.upgrade() else {
            let address = entry.address;
            warn!("frame table: reclaiming {:?} of dropped page {:#x}", frame, address);
            let mut pages = owner.page_manager.lock();
            if pages.get_physical(address) == Some(frame) {
                pages.clear(address);
            }
            drop(pages);
            self.remove_at(index);
            return Visit::Evicted;
        };

        if page.is_pinned() {
            return Visit::Skipped;
        }
        // Whoever holds the state is loading or unloading this page.
        let Some(mut state) = page.try_state() else {
            return Visit::Skipped;
        };
        if page.is_pinned() || state.frame != Some(frame) {
            return Visit::Skipped;
        }

        let address = page.address();
        let mut pages = owner.page_manager.lock();
        if second_chance && pages.is_accessed(address) {
            pages.set_accessed(address, false);
            return Visit::Skipped;
        }
        let dirty = pages.is_dirty(address);

        debug!(
            "evicting page {:#x} of process {} from {:?} (dirty: {})",
            address, owner.pid, frame, dirty
        );

        if let Backing::MemoryMapped { region, .. } = &state.backing {
            if dirty {
                // SAFETY: the page is unpinned and its state is locked, so
                // nothing else touches the frame.
                let written = unsafe { region.write_back(&frame) };
                if written != region.read_len {
                    warn!("short write-back of page {:#x}: {} of {}", address, written, region.read_len);
                }
            }
        }
        let to_swap = match &state.backing {
            Backing::Swap { slot } => {
                debug_assert!(slot.is_none(), "resident page still owns a swap slot");
                true
            }
            Backing::Executable(_) => dirty,
            Backing::MemoryMapped { .. } => false,
        };
        if to_swap {
            // SAFETY: as above.
            let slot = unsafe { swap.allocate_and_write(&frame) };
            state.backing = Backing::Swap { slot: Some(slot) };
        }

        pages.clear(address);
        drop(pages);
        state.frame = None;
        drop(state);

        self.remove_at(index);
        Visit::Evicted
    }
}
