use core::fmt;

/// Why a sector transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Sector index at or past the end of the device
    SectorOutOfBounds,
    /// Buffer length is not `BLOCK_SECTOR_SIZE`
    BufferInvalid,
    /// The driver reported a failed transfer
    Device,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BlockError::SectorOutOfBounds => "sector out of bounds",
            BlockError::BufferInvalid => "buffer is not one sector long",
            BlockError::Device => "device error",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for BlockError {}
