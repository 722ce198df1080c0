//! The supplemental page table: everything a process knows about its user
//! pages beyond what the hardware page table records.

use super::mmap::{MapId, MappingTable};
use super::page::{Backing, FileRegion, Owner, Page, PageState, PinGuard};
use super::{Error, Fault, FaultContext, Pid, Result};
use crate::fs::{BackingFile, FILESYS_LOCK};
use crate::paging::PageManager;
use crate::sync::mutex::Mutex;
use crate::system::VmSystem;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use kidneyos_shared::mem::{
    is_user_address, page_offset, page_round_down, page_round_up, PAGE_FRAME_SIZE,
};
use log::{debug, trace, warn};

pub struct SupplementalPageTable {
    system: Arc<VmSystem>,
    owner: Owner,
    /// Keyed by page-aligned virtual address.
    pages: Mutex<BTreeMap<usize, Arc<Page>>>,
    mappings: Mutex<MappingTable>,
}

impl SupplementalPageTable {
    pub fn new(pid: Pid, system: Arc<VmSystem>) -> Self {
        let page_manager = Arc::new(Mutex::new(PageManager::new(system.frames.memory())));
        Self {
            system,
            owner: Owner { pid, page_manager },
            pages: Mutex::new(BTreeMap::new()),
            mappings: Mutex::new(MappingTable::new()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.owner.pid
    }

    pub fn system(&self) -> &Arc<VmSystem> {
        &self.system
    }

    /// The hardware page table of this address space.
    pub fn page_manager(&self) -> &Arc<Mutex<PageManager>> {
        &self.owner.page_manager
    }

    pub fn lookup(&self, virt_addr: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&page_round_down(virt_addr)).cloned()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All descriptors in address order.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.lock().values().cloned().collect()
    }

    fn insert(&self, page: Arc<Page>) -> Result<()> {
        let mut pages = self.pages.lock();
        if pages.contains_key(&page.address()) {
            return Err(Error::AlreadyMapped);
        }
        pages.insert(page.address(), page);
        Ok(())
    }

    fn file_region(
        file: Arc<dyn BackingFile>,
        offset: usize,
        virtual_page: usize,
        read_len: usize,
        zero_len: usize,
    ) -> Result<FileRegion> {
        if page_offset(virtual_page) != 0 || read_len.checked_add(zero_len) != Some(PAGE_FRAME_SIZE) {
            return Err(Error::BadMapping);
        }
        if virtual_page == 0 || !is_user_address(virtual_page) {
            return Err(Error::InvalidAccess);
        }
        Ok(FileRegion {
            file,
            offset,
            read_len,
            zero_len,
        })
    }

    /// Records a lazily loaded page of a program image.
    pub fn register_executable(
        &self,
        file: Arc<dyn BackingFile>,
        offset: usize,
        virtual_page: usize,
        read_len: usize,
        zero_len: usize,
        writable: bool,
    ) -> Result<()> {
        let region = Self::file_region(file, offset, virtual_page, read_len, zero_len)?;
        self.insert(Page::new(virtual_page, writable, Backing::Executable(region)))
    }

    /// Registers every page of a program segment. `read_bytes` come from the
    /// file starting at `offset`; the following `zero_bytes` are zero filled.
    pub fn register_segment(
        &self,
        file: &Arc<dyn BackingFile>,
        mut offset: usize,
        mut virtual_page: usize,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let whole_pages = read_bytes
            .checked_add(zero_bytes)
            .is_some_and(|len| len % PAGE_FRAME_SIZE == 0);
        if !whole_pages || page_offset(virtual_page) != 0 {
            return Err(Error::BadMapping);
        }
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read = min(read_bytes, PAGE_FRAME_SIZE);
            let page_zero = PAGE_FRAME_SIZE - page_read;
            self.register_executable(
                Arc::clone(file),
                offset,
                virtual_page,
                page_read,
                page_zero,
                writable,
            )?;
            read_bytes -= page_read;
            zero_bytes -= page_zero;
            offset += page_read;
            virtual_page += PAGE_FRAME_SIZE;
        }
        Ok(())
    }

    /// Records one page of a memory-mapped file and adds it to mapping `map_id`.
    pub fn register_mapped_file(
        &self,
        file: Arc<dyn BackingFile>,
        offset: usize,
        virtual_page: usize,
        read_len: usize,
        zero_len: usize,
        map_id: MapId,
    ) -> Result<Arc<Page>> {
        let region = Self::file_region(file, offset, virtual_page, read_len, zero_len)?;
        let page = Page::new(virtual_page, true, Backing::MemoryMapped { region, map_id });
        self.insert(Arc::clone(&page))?;
        self.mappings.lock().register_mapping(map_id, Arc::clone(&page));
        Ok(page)
    }

    /// Maps all of `file` at `addr`.
    pub fn mmap(&self, file: Arc<dyn BackingFile>, addr: usize) -> Result<MapId> {
        let len = {
            let _fs = FILESYS_LOCK.lock();
            file.len()
        };
        if addr == 0 || page_offset(addr) != 0 || len == 0 {
            return Err(Error::BadMapping);
        }
        let end = addr
            .checked_add(page_round_up(len))
            .filter(|&end| end <= self.system.config.user_top)
            .ok_or(Error::BadMapping)?;
        if self.pages.lock().range(addr..end).next().is_some() {
            return Err(Error::BadMapping);
        }

        let id = self.mappings.lock().allocate_id();
        for offset in (0..len).step_by(PAGE_FRAME_SIZE) {
            let read_len = min(PAGE_FRAME_SIZE, len - offset);
            let registered = self.register_mapped_file(
                Arc::clone(&file),
                offset,
                addr + offset,
                read_len,
                PAGE_FRAME_SIZE - read_len,
                id,
            );
            if registered.is_err() {
                // Raced with another registration in the range.
                let _ = self.munmap(id);
                return Err(Error::BadMapping);
            }
        }

        debug!(
            "process {}: mapped {} bytes at {:#x} as {:?}",
            self.pid(),
            len,
            addr,
            id
        );
        Ok(id)
    }

    /// Removes mapping `id`, writing dirty pages back to the file.
    pub fn munmap(&self, id: MapId) -> Result<()> {
        let pages = self
            .mappings
            .lock()
            .unregister_mapping(id)
            .ok_or(Error::NoSuchMapping)?;
        // Unpublish first so a concurrent fault cannot reload a page after
        // it has been unloaded.
        {
            let mut map = self.pages.lock();
            for page in &pages {
                map.remove(&page.address());
            }
        }
        for page in &pages {
            let mut state = page.state();
            self.unload(page, &mut state);
        }
        debug!("process {}: unmapped {:?}", self.pid(), id);
        Ok(())
    }

    /// Drops the frame and swap slot held by `page`. Memory-mapped pages are
    /// written back if dirty; all other contents are discarded.
    fn unload(&self, page: &Page, state: &mut PageState) {
        let address = page.address();
        if let Some(frame) = state.frame.take() {
            let dirty = {
                let mut pages = self.owner.page_manager.lock();
                let dirty = pages.is_dirty(address);
                pages.clear(address);
                dirty
            };
            if let Backing::MemoryMapped { region, .. } = &state.backing {
                if dirty {
                    // SAFETY: the state lock is held and the mapping is gone.
                    let written = unsafe { region.write_back(&frame) };
                    if written != region.read_len {
                        warn!(
                            "short write-back of page {:#x}: {} of {}",
                            address, written, region.read_len
                        );
                    }
                }
            }
            self.system.frames.release(frame);
        }
        if let Backing::Swap { slot } = &mut state.backing {
            if let Some(slot) = slot.take() {
                self.system.swap.free(slot);
            }
        }
    }

    /// Releases every frame, swap slot and mapping of this address space.
    /// Calling it again does nothing.
    pub fn destroy(&self) {
        let ids = self.mappings.lock().ids();
        for id in ids {
            let _ = self.munmap(id);
        }

        let pages = core::mem::take(&mut *self.pages.lock());
        let count = pages.len();
        for page in pages.into_values() {
            let mut state = page.state();
            self.unload(&page, &mut state);
        }
        if count > 0 {
            debug!("process {}: destroyed {} pages", self.pid(), count);
        }
    }

    /// Brings the page containing `fault.address` into memory.
    ///
    /// Faults on unknown addresses close enough to the stack pointer grow the
    /// stack. From [`FaultContext::Syscall`] the page stays pinned until the
    /// returned guard is dropped.
    pub fn resolve_fault(&self, fault: Fault) -> Result<Option<PinGuard>> {
        trace!(
            "process {}: fault at {:#x} ({})",
            self.pid(),
            fault.address,
            if fault.write { "write" } else { "read" }
        );
        self.fault_in(&fault).map(|pin| fault.context.retain(pin))
    }

    fn fault_in(&self, fault: &Fault) -> Result<PinGuard> {
        if !is_user_address(fault.address) {
            return Err(Error::InvalidAccess);
        }
        let page = loop {
            if let Some(page) = self.lookup(fault.address) {
                break page;
            }
            if !self.is_stack_access(fault) {
                return Err(Error::InvalidAccess);
            }
            match self.grow(fault.address) {
                // Another thread grew the stack here first.
                Err(Error::AlreadyMapped) => continue,
                result => return result,
            }
        };
        if fault.write && !page.writable() {
            return Err(Error::InvalidAccess);
        }

        let pin = page.pin();
        let mut state = page.state();
        if !self.is_published(&page) {
            // Unmapped or destroyed while we waited for the state lock.
            return Err(Error::InvalidAccess);
        }
        if state.is_resident() {
            return Err(Error::AlreadyResident);
        }
        self.load(&page, &mut state)?;
        drop(state);
        Ok(pin)
    }

    fn is_published(&self, page: &Arc<Page>) -> bool {
        self.lookup(page.address())
            .is_some_and(|current| Arc::ptr_eq(&current, page))
    }

    fn is_stack_access(&self, fault: &Fault) -> bool {
        let config = &self.system.config;
        fault.address < config.user_top
            && fault.address >= fault.stack_pointer.saturating_sub(config.stack_heuristic)
    }

    /// Adds a zeroed, resident stack page at `fault_address`.
    pub fn grow_stack(
        &self,
        fault_address: usize,
        context: FaultContext,
    ) -> Result<Option<PinGuard>> {
        self.grow(fault_address).map(|pin| context.retain(pin))
    }

    fn grow(&self, fault_address: usize) -> Result<PinGuard> {
        let config = &self.system.config;
        let address = page_round_down(fault_address);
        if address >= config.user_top || config.user_top - address > config.stack_limit {
            return Err(Error::StackLimitExceeded);
        }

        let page = Page::new(address, true, Backing::Swap { slot: None });
        let pin = page.pin();
        let mut state = page.state();
        self.insert(Arc::clone(&page))?;
        if let Err(e) = self.load(&page, &mut state) {
            drop(state);
            self.pages.lock().remove(&address);
            return Err(e);
        }
        drop(state);
        trace!("process {}: stack grown to {:#x}", self.pid(), address);
        Ok(pin)
    }

    /// Fills a frame for `page` and maps it. The page must be pinned and
    /// `state` must be its locked, non-resident state.
    fn load(&self, page: &Arc<Page>, state: &mut PageState) -> Result<()> {
        let frames = &self.system.frames;
        let swap = &self.system.swap;
        let mut from_swap = false;

        let frame = match &mut state.backing {
            Backing::Executable(region) | Backing::MemoryMapped { region, .. } => {
                let frame = frames.acquire(region.read_len == 0, page, &self.owner);
                // SAFETY: the frame is not mapped yet and the page is pinned
                // with its state locked, so eviction leaves it alone.
                if !unsafe { region.load_into(&frame) } {
                    frames.release(frame);
                    return Err(Error::ReadFailed);
                }
                frame
            }
            Backing::Swap { slot } => match slot.take() {
                Some(slot) => {
                    let frame = frames.acquire(false, page, &self.owner);
                    // SAFETY: as above.
                    unsafe { swap.read_and_free(slot, &frame) };
                    from_swap = true;
                    frame
                }
                None => frames.acquire(true, page, &self.owner),
            },
        };

        let installed = self
            .owner
            .page_manager
            .lock()
            .install(page.address(), frame, page.writable());
        if !installed {
            if from_swap {
                // SAFETY: as above.
                let slot = unsafe { swap.allocate_and_write(&frame) };
                state.backing = Backing::Swap { slot: Some(slot) };
            }
            frames.release(frame);
            return Err(Error::InstallFailed);
        }

        state.frame = Some(frame);
        Ok(())
    }

    /// Faults in the page at `fault.address` if needed and pins it.
    pub fn pin_page(&self, fault: Fault) -> Result<PinGuard> {
        let fault = Fault {
            context: FaultContext::Syscall,
            ..fault
        };
        loop {
            let Some(page) = self.lookup(fault.address) else {
                match self.fault_in(&fault) {
                    // A racing fault created and loaded the page; pin it above.
                    Err(Error::AlreadyResident) => continue,
                    result => return result,
                }
            };
            if fault.write && !page.writable() {
                return Err(Error::InvalidAccess);
            }
            let pin = page.pin();
            if page.is_resident() {
                return Ok(pin);
            }
            return match self.fault_in(&fault) {
                Ok(pin) => Ok(pin),
                // Loaded by another thread after the residency check.
                Err(Error::AlreadyResident) => Ok(pin),
                Err(e) => Err(e),
            };
        }
    }
}
