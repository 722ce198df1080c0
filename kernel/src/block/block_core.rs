use crate::block::block_error::BlockError;
use alloc::{boxed::Box, string::String, vec::Vec};
use core::fmt;
use log::info;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyos_shared::sizes::SECTOR_SIZE;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// What a block device is used for.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by non-KidneyOS operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
pub trait BlockOp: Send {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device
pub struct Block {
    /// Unique and immutable index of the block
    index: usize,
    /// Tha name of the block device
    block_name: String,

    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,

    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: u32,
    /// The write count
    write_count: u32,
}

impl Block {
    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        // Ensure that we are not writing to a foreign block
        assert!(
            self.block_type != BlockType::Foreign,
            "Cannot write to foreign block"
        );

        self.driver.write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn get_index(&self) -> usize {
        self.index
    }
    pub fn get_read_count(&self) -> u32 {
        self.read_count
    }
    pub fn get_write_count(&self) -> u32 {
        self.write_count
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "    {:04} | \"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.index,
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count,
            self.write_count
        )
    }
}

/// Maintain a list of blocks
#[derive(Default)]
pub struct BlockManager {
    /// All the block devices
    all_blocks: Vec<Block>,
    /// The index handed to the next registered device
    next_index: usize,
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block device with the given `name`. The block device's `size` in sectors and its
    /// `device_type` must be provided, as well as the `driver` to access the block.
    ///
    /// Returns the index of the block device.
    pub fn register_block(
        &mut self,
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> usize {
        let index = self.next_index;
        self.all_blocks.push(Block {
            index,
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        });

        info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name, block_type, block_size,
        );

        self.next_index += 1;
        index
    }

    /// Get the block device with the given `index`.
    pub fn by_id(&mut self, idx: usize) -> Option<&mut Block> {
        self.all_blocks.iter_mut().find(|b| b.index == idx)
    }

    /// Get the block device with the given `name`.
    ///
    /// **Note:** This function is very inefficient and should be avoided.
    pub fn by_name(&mut self, name: &str) -> Option<&mut Block> {
        self.all_blocks.iter_mut().find(|b| b.block_name == name)
    }

    /// Detach the first device registered for `block_type`, handing ownership to the
    /// subsystem that will drive it exclusively (e.g. swap).
    pub fn take_by_type(&mut self, block_type: BlockType) -> Option<Block> {
        let at = self
            .all_blocks
            .iter()
            .position(|b| b.block_type == block_type)?;
        Some(self.all_blocks.remove(at))
    }
}

impl fmt::Display for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block Devices:")?;
        for block in &self.all_blocks {
            writeln!(f, "{}", block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;

    fn manager_with_disk(sectors: BlockSector) -> BlockManager {
        let mut manager = BlockManager::new();
        manager.register_block(
            BlockType::Raw,
            "ram0",
            sectors,
            Box::new(RamDisk::new(sectors)),
        );
        manager
    }

    #[test]
    fn read_back_written_sector() {
        let mut manager = manager_with_disk(4);
        let block = manager.by_name("ram0").expect("registered");
        let data = [0xabu8; BLOCK_SECTOR_SIZE];
        block.write(3, &data).expect("in bounds");

        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        block.read(3, &mut buf).expect("in bounds");
        assert_eq!(buf, data);
        assert_eq!(block.get_read_count(), 1);
        assert_eq!(block.get_write_count(), 1);
    }

    #[test]
    fn rejects_out_of_bounds_and_short_buffers() {
        let mut manager = manager_with_disk(4);
        let block = manager.by_id(0).expect("registered");
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(4, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(block.write(0, &buf[..10]), Err(BlockError::BufferInvalid));
        assert_eq!(block.get_read_count(), 0);
        assert_eq!(block.get_write_count(), 0);
    }

    #[test]
    fn take_by_type_detaches_device() {
        let mut manager = manager_with_disk(4);
        manager.register_block(BlockType::Swap, "swap", 16, Box::new(RamDisk::new(16)));

        let swap = manager.take_by_type(BlockType::Swap).expect("swap registered");
        assert_eq!(swap.get_name(), "swap");
        assert_eq!(swap.get_index(), 1);
        assert!(manager.take_by_type(BlockType::Swap).is_none());
        assert!(manager.by_name("ram0").is_some());
    }
}
