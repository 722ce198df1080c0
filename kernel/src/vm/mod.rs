//! Demand paging: supplemental page tables, the global frame table with
//! clock eviction, and swap.

pub mod frame;
pub mod mmap;
pub mod page;
pub mod spage;
pub mod swap;
pub mod user;

pub use frame::FrameTable;
pub use mmap::{MapId, MappingTable};
pub use page::{Backing, FileRegion, Owner, Page, PageState, PinGuard};
pub use spage::SupplementalPageTable;
pub use swap::{SwapManager, SwapSlot};

use crate::mem::Placement;
use kidneyos_shared::mem::{MAX_STACK_SIZE, OFFSET, STACK_HEURISTIC};

pub type Pid = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// a descriptor already exists at that address
    AlreadyMapped,
    /// fault on a page that is already in memory
    AlreadyResident,
    /// stack growth would exceed the stack limit
    StackLimitExceeded,
    /// user access to an address it may not touch
    InvalidAccess,
    /// the hardware mapping could not be installed
    InstallFailed,
    /// the backing file returned fewer bytes than the page needs
    ReadFailed,
    /// memory map request rejected
    BadMapping,
    /// no mapping with that id
    NoSuchMapping,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "page already registered"),
            Self::AlreadyResident => write!(f, "page already resident"),
            Self::StackLimitExceeded => write!(f, "stack limit exceeded"),
            Self::InvalidAccess => write!(f, "invalid memory access"),
            Self::InstallFailed => write!(f, "could not install page mapping"),
            Self::ReadFailed => write!(f, "short read from backing file"),
            Self::BadMapping => write!(f, "invalid memory mapping"),
            Self::NoSuchMapping => write!(f, "no such mapping"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Boot-time parameters of the VM subsystem.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Number of physical frames available to user pages.
    pub user_frames: usize,
    pub placement: Placement,
    /// Maximum size of a user stack in bytes.
    pub stack_limit: usize,
    /// How far below the stack pointer a fault still counts as a stack access.
    pub stack_heuristic: usize,
    /// One past the highest user address; stacks grow down from here.
    pub user_top: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: 1024,
            placement: Placement::NextFit,
            stack_limit: MAX_STACK_SIZE,
            stack_heuristic: STACK_HEURISTIC,
            user_top: OFFSET,
        }
    }
}

/// Where a fault was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultContext {
    /// The page-fault handler, on behalf of a user instruction that will be
    /// retried. The page is unpinned before resolution returns.
    Interrupt,
    /// A system call validating a user buffer. The page stays pinned until the
    /// returned guard is dropped.
    Syscall,
}

impl FaultContext {
    fn retain(self, pin: PinGuard) -> Option<PinGuard> {
        match self {
            FaultContext::Interrupt => {
                drop(pin);
                None
            }
            FaultContext::Syscall => Some(pin),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Fault {
    pub address: usize,
    /// User stack pointer at the time of the fault.
    pub stack_pointer: usize,
    pub write: bool,
    pub context: FaultContext,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::swap::SECTORS_PER_SLOT;
    use super::{FaultContext, Fault, VmConfig};
    use crate::block::block_core::{BlockManager, BlockSector, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::system::VmSystem;
    use std::sync::Arc;

    pub const STACK_TOP: usize = kidneyos_shared::mem::OFFSET;

    pub fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// A system with `frames` user frames and a RAM-disk swap partition of
    /// `swap_slots` slots.
    pub fn system(frames: usize, swap_slots: usize) -> Arc<VmSystem> {
        init_logging();
        let sectors = BlockSector::try_from(swap_slots * SECTORS_PER_SLOT).expect("swap fits");
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)));
        let config = VmConfig {
            user_frames: frames,
            ..Default::default()
        };
        VmSystem::new(config, blocks.take_by_type(BlockType::Swap))
    }

    pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
            .collect()
    }

    pub fn user_fault(address: usize, write: bool) -> Fault {
        Fault {
            address,
            stack_pointer: address,
            write,
            context: FaultContext::Interrupt,
        }
    }
}
