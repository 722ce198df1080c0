//! The per-process hardware page table, as the rest of the VM code sees it.
//!
//! Entries use the real x86 layout from `kidneyos_shared::paging`; the
//! table itself is a flat map from virtual page number to entry, and
//! [`PageManager::access`] plays the part of the MMU walking it.

use crate::mem::{Frame, PhysicalMemory};
use alloc::collections::BTreeMap;
use kidneyos_shared::mem::{is_user_address, page_offset};
use kidneyos_shared::paging::{page_number, PageTableEntry};

/// Result of translating a user access.
#[derive(Debug, PartialEq, Eq)]
pub enum Access {
    /// Translation succeeded; the MMU has updated the accessed/dirty bits.
    Mapped(Frame),
    /// No present entry: a page fault.
    NotPresent,
    /// Write to a read-only entry: a protection fault.
    ReadOnly,
}

pub struct PageManager {
    memory: PhysicalMemory,
    entries: BTreeMap<usize, PageTableEntry>,
}

impl PageManager {
    pub fn new(memory: PhysicalMemory) -> Self {
        Self {
            memory,
            entries: BTreeMap::new(),
        }
    }

    /// Maps user page `virt_addr` to `frame`. Fails if the address is a kernel
    /// address, is already mapped, or the frame lies outside user memory.
    #[must_use]
    pub fn install(&mut self, virt_addr: usize, frame: Frame, writable: bool) -> bool {
        debug_assert_eq!(page_offset(virt_addr), 0);
        if !is_user_address(virt_addr) || self.memory.frame(frame.number()).is_none() {
            return false;
        }
        let vpn = page_number(virt_addr);
        if self.entries.get(&vpn).is_some_and(|e| e.present()) {
            return false;
        }
        self.entries
            .insert(vpn, PageTableEntry::user_mapping(frame.number(), writable));
        true
    }

    fn entry(&self, virt_addr: usize) -> Option<&PageTableEntry> {
        self.entries
            .get(&page_number(virt_addr))
            .filter(|e| e.present())
    }

    fn update(&mut self, virt_addr: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entries.get_mut(&page_number(virt_addr)) {
            if entry.present() {
                *entry = f(*entry);
            }
        }
    }

    pub fn get_physical(&self, virt_addr: usize) -> Option<Frame> {
        self.entry(virt_addr)
            .and_then(|e| self.memory.frame(e.frame_number()))
    }

    /// Removes the mapping for `virt_addr`, if any. Further accesses fault.
    pub fn clear(&mut self, virt_addr: usize) {
        self.entries.remove(&page_number(virt_addr));
    }

    pub fn is_accessed(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr).is_some_and(|e| e.accessed())
    }

    pub fn set_accessed(&mut self, virt_addr: usize, accessed: bool) {
        self.update(virt_addr, |e| e.with_accessed(accessed));
    }

    pub fn is_dirty(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr).is_some_and(|e| e.dirty())
    }

    pub fn set_dirty(&mut self, virt_addr: usize, dirty: bool) {
        self.update(virt_addr, |e| e.with_dirty(dirty));
    }

    pub fn is_writable(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr).is_some_and(|e| e.read_write())
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    /// Translates a user access the way the MMU would, setting the accessed
    /// bit (and the dirty bit for writes) on success.
    pub fn access(&mut self, virt_addr: usize, write: bool) -> Access {
        let Some(entry) = self.entry(virt_addr).copied() else {
            return Access::NotPresent;
        };
        if write && !entry.read_write() {
            return Access::ReadOnly;
        }
        let Some(frame) = self.memory.frame(entry.frame_number()) else {
            return Access::NotPresent;
        };
        let entry = entry.with_accessed(true);
        let entry = if write { entry.with_dirty(true) } else { entry };
        self.entries.insert(page_number(virt_addr), entry);
        Access::Mapped(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{PagePool, Placement};
    use kidneyos_shared::mem::{OFFSET, PAGE_FRAME_SIZE};

    #[test]
    fn install_then_translate() {
        let mut pool = PagePool::new(2, Placement::NextFit);
        let frame = pool.get_page(true).expect("free frame");
        let mut pages = PageManager::new(pool.memory());

        assert!(pages.install(0x1000, frame, true));
        assert_eq!(pages.get_physical(0x1234), Some(frame));
        assert!(!pages.is_accessed(0x1000));

        assert_eq!(pages.access(0x1010, false), Access::Mapped(frame));
        assert!(pages.is_accessed(0x1000));
        assert!(!pages.is_dirty(0x1000));

        assert_eq!(pages.access(0x1010, true), Access::Mapped(frame));
        assert!(pages.is_dirty(0x1000));

        pages.set_accessed(0x1000, false);
        assert!(!pages.is_accessed(0x1000));
        assert!(pages.is_dirty(0x1000));
    }

    #[test]
    fn read_only_pages_reject_writes() {
        let mut pool = PagePool::new(1, Placement::NextFit);
        let frame = pool.get_page(true).expect("free frame");
        let mut pages = PageManager::new(pool.memory());

        assert!(pages.install(0x2000, frame, false));
        assert_eq!(pages.access(0x2000, true), Access::ReadOnly);
        assert!(!pages.is_dirty(0x2000));
        assert_eq!(pages.access(0x2000, false), Access::Mapped(frame));
    }

    #[test]
    fn install_rejects_duplicates_and_kernel_addresses() {
        let mut pool = PagePool::new(2, Placement::NextFit);
        let a = pool.get_page(true).expect("free frame");
        let b = pool.get_page(true).expect("free frame");
        let mut pages = PageManager::new(pool.memory());

        assert!(pages.install(0x3000, a, true));
        assert!(!pages.install(0x3000, b, true));
        assert!(!pages.install(OFFSET, b, true));
        assert!(!pages.install(OFFSET + PAGE_FRAME_SIZE, b, true));
    }

    #[test]
    fn clear_unmaps() {
        let mut pool = PagePool::new(1, Placement::NextFit);
        let frame = pool.get_page(true).expect("free frame");
        let mut pages = PageManager::new(pool.memory());

        assert!(pages.install(0x4000, frame, true));
        pages.clear(0x4000);
        assert_eq!(pages.get_physical(0x4000), None);
        assert_eq!(pages.access(0x4000, false), Access::NotPresent);
        assert_eq!(pages.mapped_pages(), 0);
        assert!(pages.install(0x4000, frame, true));
    }
}
