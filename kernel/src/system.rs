use crate::block::block_core::{Block, BlockManager, BlockType};
use crate::mem::{PagePool, PhysicalMemory};
use crate::vm::{FrameTable, Pid, SupplementalPageTable, SwapManager, VmConfig};
use alloc::boxed::Box;
use alloc::sync::Arc;
use log::info;
use once_cell::race::OnceBox;

/// The kernel-wide half of virtual memory: user frames and swap.
pub struct VmSystem {
    pub config: VmConfig,
    pub frames: FrameTable,
    pub swap: Arc<SwapManager>,
}

impl VmSystem {
    /// Builds a system whose user frames are allocated from the kernel heap.
    pub fn new(config: VmConfig, swap_device: Option<Block>) -> Arc<Self> {
        let pool = PagePool::new(config.user_frames, config.placement);
        Self::with_pool(config, pool, swap_device)
    }

    /// Builds a system over a physical region reserved at boot.
    ///
    /// # Safety
    ///
    /// See [`PagePool::new_in`].
    pub unsafe fn new_in(
        config: VmConfig,
        memory: PhysicalMemory,
        swap_device: Option<Block>,
    ) -> Arc<Self> {
        let pool = PagePool::new_in(memory, config.placement);
        Self::with_pool(config, pool, swap_device)
    }

    fn with_pool(config: VmConfig, pool: PagePool, swap_device: Option<Block>) -> Arc<Self> {
        let swap = Arc::new(SwapManager::initialize(swap_device));
        info!(
            "vm: {} user frames, {:?} placement, {} swap slots",
            pool.total_pages(),
            config.placement,
            swap.slot_count()
        );
        Arc::new(Self {
            frames: FrameTable::new(pool, Arc::clone(&swap)),
            swap,
            config,
        })
    }

    /// A fresh, empty address space for process `pid`.
    pub fn address_space(self: &Arc<Self>, pid: Pid) -> SupplementalPageTable {
        SupplementalPageTable::new(pid, Arc::clone(self))
    }
}

static SYSTEM: OnceBox<Arc<VmSystem>> = OnceBox::new();

/// Brings up virtual memory at boot, claiming the swap partition from
/// `blocks` if one is registered.
pub fn vm_init(config: VmConfig, blocks: &mut BlockManager) -> Arc<VmSystem> {
    let system = VmSystem::new(config, blocks.take_by_type(BlockType::Swap));
    if SYSTEM.set(Box::new(Arc::clone(&system))).is_err() {
        panic!("virtual memory initialized twice");
    }
    system
}

pub fn vm_system() -> Arc<VmSystem> {
    match SYSTEM.get() {
        Some(system) => Arc::clone(system),
        None => panic!("System not initialized."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;
    use crate::vm::swap::SECTORS_PER_SLOT;
    use crate::vm::test_support::init_logging;

    #[test]
    fn boot_claims_swap_partition() {
        init_logging();
        let sectors = (16 * SECTORS_PER_SLOT) as u32;
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::FileSystem, "fs", 8, Box::new(RamDisk::new(8)));
        blocks.register_block(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)));

        let config = VmConfig {
            user_frames: 8,
            ..Default::default()
        };
        let system = vm_init(config, &mut blocks);
        assert!(Arc::ptr_eq(&system, &vm_system()));
        assert_eq!(system.swap.slot_count(), 16);
        assert_eq!(system.frames.capacity(), 8);
        assert!(blocks.take_by_type(BlockType::Swap).is_none());
        assert!(blocks.by_name("fs").is_some());

        let spt = system.address_space(3);
        assert_eq!(spt.pid(), 3);
        assert!(spt.is_empty());
    }
}
