//! Page-sized slots on the swap partition.

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::mem::Frame;
use crate::sync::mutex::Mutex;
use kidneyos_shared::{bitmap::Bitmap, mem::PAGE_FRAME_SIZE};
use log::{info, trace};

pub const SECTORS_PER_SLOT: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of a page-sized region of the swap partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sector(self, i: usize) -> BlockSector {
        (self.0 * SECTORS_PER_SLOT + i) as BlockSector
    }
}

struct SwapState {
    device: Option<Block>,
    /// One bit per slot, set while the slot holds a page.
    slots: Bitmap,
}

pub struct SwapManager {
    state: Mutex<SwapState>,
}

impl SwapManager {
    /// Takes ownership of the swap partition. Running without one is allowed
    /// until the first page actually needs swapping.
    pub fn initialize(device: Option<Block>) -> Self {
        let slots = match &device {
            Some(device) => {
                let slots = device.get_size() as usize / SECTORS_PER_SLOT;
                info!(
                    "swap: using {} ({} slots, {} KiB)",
                    device.get_name(),
                    slots,
                    slots * PAGE_FRAME_SIZE / 1024
                );
                slots
            }
            None => {
                info!("swap: no swap partition");
                0
            }
        };

        Self {
            state: Mutex::new(SwapState {
                device,
                slots: Bitmap::new(slots),
            }),
        }
    }

    pub fn is_present(&self) -> bool {
        self.state.lock().device.is_some()
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.state.lock().slots.count_ones()
    }

    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        let state = self.state.lock();
        slot.0 < state.slots.len() && state.slots.test(slot.0)
    }

    /// Writes the contents of `frame` to the first free slot.
    ///
    /// Panics if there is no swap partition or it is full.
    ///
    /// # Safety
    ///
    /// Nothing may write to `frame` for the duration of the call.
    pub unsafe fn allocate_and_write(&self, frame: &Frame) -> SwapSlot {
        let mut state = self.state.lock();
        let SwapState { device, slots } = &mut *state;
        let Some(device) = device else {
            panic!("swap partition needed but not present");
        };
        let Some(index) = slots.scan_and_flip(false) else {
            panic!("swap partition is full");
        };
        let slot = SwapSlot(index);

        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..SECTORS_PER_SLOT {
            // SAFETY: forwarded from the caller.
            unsafe { frame.read(i * BLOCK_SECTOR_SIZE, &mut buf) };
            device
                .write(slot.sector(i), &buf)
                .unwrap_or_else(|e| panic!("swap write to slot {index} failed: {e}"));
        }

        trace!("swap: {:?} -> slot {}", frame, index);
        slot
    }

    /// Reads `slot` into `frame` and frees the slot.
    ///
    /// # Safety
    ///
    /// No other reference to the contents of `frame` may be live.
    pub unsafe fn read_and_free(&self, slot: SwapSlot, frame: &Frame) {
        let mut state = self.state.lock();
        let SwapState { device, slots } = &mut *state;
        let Some(device) = device else {
            panic!("swap partition needed but not present");
        };
        assert!(
            slot.0 < slots.len() && slots.test(slot.0),
            "reading free swap slot {}",
            slot.0
        );

        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..SECTORS_PER_SLOT {
            device
                .read(slot.sector(i), &mut buf)
                .unwrap_or_else(|e| panic!("swap read from slot {} failed: {e}", slot.0));
            // SAFETY: forwarded from the caller.
            unsafe { frame.write(i * BLOCK_SECTOR_SIZE, &buf) };
        }
        slots.set(slot.0, false);

        trace!("swap: slot {} -> {:?}", slot.0, frame);
    }

    /// Releases `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        let mut state = self.state.lock();
        assert!(
            slot.0 < state.slots.len() && state.slots.test(slot.0),
            "freeing free swap slot {}",
            slot.0
        );
        state.slots.set(slot.0, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{BlockManager, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::mem::{PagePool, Placement};

    fn manager(slots: usize) -> SwapManager {
        let sectors = (slots * SECTORS_PER_SLOT) as BlockSector;
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)));
        SwapManager::initialize(blocks.take_by_type(BlockType::Swap))
    }

    #[test]
    fn slot_count_from_device_size() {
        let swap = manager(5);
        assert!(swap.is_present());
        assert_eq!(swap.slot_count(), 5);
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn write_then_read_restores_frame() {
        let swap = manager(2);
        let mut pool = PagePool::new(2, Placement::FirstFit);
        let src = pool.get_page(true).unwrap();
        let dst = pool.get_page(true).unwrap();
        let data: Vec<u8> = (0..PAGE_FRAME_SIZE).map(|i| (i % 251) as u8).collect();

        unsafe {
            src.write(0, &data);
            let slot = swap.allocate_and_write(&src);
            assert!(swap.is_in_use(slot));
            assert_eq!(swap.slots_in_use(), 1);

            swap.read_and_free(slot, &dst);
            assert!(!swap.is_in_use(slot));

            let mut out = vec![0u8; PAGE_FRAME_SIZE];
            dst.read(0, &mut out);
            assert_eq!(out, data);
        }
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn slots_are_first_fit() {
        let swap = manager(3);
        let mut pool = PagePool::new(1, Placement::FirstFit);
        let frame = pool.get_page(true).unwrap();

        let (a, b) = unsafe { (swap.allocate_and_write(&frame), swap.allocate_and_write(&frame)) };
        assert_eq!((a.index(), b.index()), (0, 1));
        swap.free(a);
        let c = unsafe { swap.allocate_and_write(&frame) };
        assert_eq!(c.index(), 0);
    }

    #[test]
    #[should_panic(expected = "swap partition is full")]
    fn full_partition_is_fatal() {
        let swap = manager(1);
        let mut pool = PagePool::new(1, Placement::FirstFit);
        let frame = pool.get_page(true).unwrap();
        unsafe {
            swap.allocate_and_write(&frame);
            swap.allocate_and_write(&frame);
        }
    }

    #[test]
    #[should_panic(expected = "swap partition needed but not present")]
    fn missing_partition_is_fatal_on_use() {
        let swap = SwapManager::initialize(None);
        assert_eq!(swap.slot_count(), 0);
        let mut pool = PagePool::new(1, Placement::FirstFit);
        let frame = pool.get_page(true).unwrap();
        unsafe { swap.allocate_and_write(&frame) };
    }

    #[test]
    #[should_panic(expected = "freeing free swap slot")]
    fn double_free_is_fatal() {
        let swap = manager(1);
        let mut pool = PagePool::new(1, Placement::FirstFit);
        let frame = pool.get_page(true).unwrap();
        let slot = unsafe { swap.allocate_and_write(&frame) };
        swap.free(slot);
        swap.free(slot);
    }
}
