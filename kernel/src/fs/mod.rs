//! The slice of the file layer that demand paging consumes: positional reads
//! and writes on an open file.

use crate::sync::mutex::Mutex;
use alloc::vec::Vec;
use core::cmp::min;

/// Serializes every call into the file system. Page loading and write-back
/// take this around each `read_at`/`write_at`.
pub static FILESYS_LOCK: Mutex<()> = Mutex::new(());

/// An open file that can back executable or memory-mapped pages.
pub trait BackingFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`; returns the number read.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;
    /// Writes up to `buf.len()` bytes starting at `offset`; returns the number written.
    /// Never extends the file.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;
    /// Length of the file in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// in-memory file
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let count = min(buf.len(), data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        count
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let count = min(buf.len(), data.len() - offset);
        data[offset..offset + count].copy_from_slice(&buf[..count]);
        count
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }
}
