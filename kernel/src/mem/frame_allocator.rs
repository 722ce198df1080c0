mod placement_algorithms;

use super::{Frame, PhysicalMemory};
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::vec;
use bitbybit::bitfield;
use core::ptr::NonNull;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use placement_algorithms::{FirstFit, NextFit, PlacementAlgorithm};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// How the pool chooses among free frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    NextFit,
    FirstFit,
}

impl Placement {
    fn algorithm(self) -> Box<dyn PlacementAlgorithm> {
        match self {
            Placement::NextFit => Box::<NextFit>::default(),
            Placement::FirstFit => Box::new(FirstFit),
        }
    }
}

/// The physical page allocator for user frames: a core map with one entry
/// per frame of a contiguous region.
pub struct PagePool {
    memory: PhysicalMemory,
    core_map: Box<[CoreMapEntry]>,
    placement_algorithm: Box<dyn PlacementAlgorithm>,
    frames_allocated: usize,
    /// Set when the pool allocated `memory` itself and must free it.
    owned: Option<Layout>,
}

impl PagePool {
    /// A pool of `frames` frames carved out of the kernel heap.
    pub fn new(frames: usize, placement: Placement) -> Self {
        let (base, owned) = match Layout::from_size_align(frames * PAGE_FRAME_SIZE, PAGE_FRAME_SIZE)
        {
            Ok(layout) if layout.size() > 0 => {
                // SAFETY: layout has a non-zero size.
                let ptr = unsafe { alloc_zeroed(layout) };
                let Some(base) = NonNull::new(ptr) else {
                    panic!("could not reserve {frames} frames for the user pool");
                };
                (base, Some(layout))
            }
            _ => (NonNull::dangling(), None),
        };
        // SAFETY: the region was just allocated for exactly `frames` frames
        // (or is empty), and lives until drop.
        let memory = unsafe { PhysicalMemory::new(base, if owned.is_some() { frames } else { 0 }) };
        Self::with_memory(memory, placement, owned)
    }

    /// A pool over memory the caller already owns, e.g. the region left over
    /// after the kernel heap at boot.
    ///
    /// # Safety
    ///
    /// `memory` must stay valid and unused by anyone else for the lifetime of
    /// the pool.
    pub unsafe fn new_in(memory: PhysicalMemory, placement: Placement) -> Self {
        Self::with_memory(memory, placement, None)
    }

    fn with_memory(memory: PhysicalMemory, placement: Placement, owned: Option<Layout>) -> Self {
        Self {
            memory,
            core_map: vec![CoreMapEntry::DEFAULT; memory.frames()].into_boxed_slice(),
            placement_algorithm: placement.algorithm(),
            frames_allocated: 0,
            owned,
        }
    }

    pub fn memory(&self) -> PhysicalMemory {
        self.memory
    }

    pub fn total_pages(&self) -> usize {
        self.core_map.len()
    }

    pub fn allocated_pages(&self) -> usize {
        self.frames_allocated
    }

    pub fn is_allocated(&self, frame: Frame) -> bool {
        self.core_map
            .get(frame.number())
            .is_some_and(|entry| entry.allocated())
    }

    /// Hands out one free frame, zeroed if `zero` is set.
    pub fn get_page(&mut self, zero: bool) -> Option<Frame> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }

        let range = self.placement_algorithm.place(&self.core_map, 1)?;
        let number = range.start;
        assert!(!self.core_map[number].allocated());
        self.core_map[number] = self.core_map[number].with_allocated(true);
        self.frames_allocated += 1;

        let frame = self.memory.frame(number)?;
        if zero {
            // SAFETY: the frame was free, so nobody else references it.
            unsafe { frame.zero_from(0) };
        }
        Some(frame)
    }

    /// Returns `frame` to the pool.
    pub fn free_page(&mut self, frame: Frame) {
        let number = frame.number();
        assert!(
            self.core_map[number].allocated(),
            "double free of frame {number}"
        );
        self.core_map[number] = self.core_map[number].with_allocated(false);
        self.frames_allocated -= 1;
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        if let Some(layout) = self.owned {
            // SAFETY: allocated in `new` with this layout.
            unsafe { dealloc(self.memory.base.as_ptr(), layout) };
        }
    }
}
