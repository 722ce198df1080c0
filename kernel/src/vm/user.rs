//! Access to user memory from system calls.

use super::page::PinGuard;
use super::spage::SupplementalPageTable;
use super::{Error, Fault, FaultContext, Result};
use crate::mem::Frame;
use crate::paging::Access;
use alloc::vec::Vec;
use core::cmp::{max, min};
use core::ops::Range;
use kidneyos_shared::mem::{is_user_address, page_offset, page_round_down, PAGE_FRAME_SIZE};

/// A validated user buffer. Its pages stay resident until this is dropped.
pub struct PinnedBuffer {
    start: usize,
    len: usize,
    pins: Vec<PinGuard>,
}

impl PinnedBuffer {
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pages(&self) -> usize {
        self.pins.len()
    }
}

fn user_range(addr: usize, len: usize) -> Result<Range<usize>> {
    let end = addr.checked_add(len).ok_or(Error::InvalidAccess)?;
    if len > 0 && (addr == 0 || !is_user_address(end - 1)) {
        return Err(Error::InvalidAccess);
    }
    Ok(addr..end)
}

/// Faults in and pins every page of `addr..addr + len`.
pub fn pin_user_buffer(
    spt: &SupplementalPageTable,
    addr: usize,
    len: usize,
    stack_pointer: usize,
    write: bool,
) -> Result<PinnedBuffer> {
    let range = user_range(addr, len)?;
    let mut pins = Vec::new();
    if !range.is_empty() {
        for page in (page_round_down(range.start)..range.end).step_by(PAGE_FRAME_SIZE) {
            pins.push(spt.pin_page(Fault {
                address: max(page, range.start),
                stack_pointer,
                write,
                context: FaultContext::Syscall,
            })?);
        }
    }
    Ok(PinnedBuffer { start: addr, len, pins })
}

/// Walks `addr..addr + len` page by page through the MMU, faulting pages in
/// as needed. `f` runs with the page table locked, so the frame it is given
/// cannot be evicted underneath it.
fn for_each_chunk(
    spt: &SupplementalPageTable,
    addr: usize,
    len: usize,
    stack_pointer: usize,
    write: bool,
    mut f: impl FnMut(Frame, usize, Range<usize>),
) -> Result<()> {
    let range = user_range(addr, len)?;
    let mut done = 0;
    while done < len {
        let va = range.start + done;
        let chunk = min(len - done, PAGE_FRAME_SIZE - page_offset(va));
        loop {
            let mut pages = spt.page_manager().lock();
            match pages.access(va, write) {
                Access::Mapped(frame) => {
                    f(frame, page_offset(va), done..done + chunk);
                    break;
                }
                Access::ReadOnly => return Err(Error::InvalidAccess),
                Access::NotPresent => {
                    drop(pages);
                    let fault = Fault {
                        address: va,
                        stack_pointer,
                        write,
                        context: FaultContext::Interrupt,
                    };
                    match spt.resolve_fault(fault) {
                        Ok(_) | Err(Error::AlreadyResident) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        done += chunk;
    }
    Ok(())
}

/// Copies `src` to user address `dst`.
pub fn copy_to_user(
    spt: &SupplementalPageTable,
    dst: usize,
    src: &[u8],
    stack_pointer: usize,
) -> Result<()> {
    for_each_chunk(spt, dst, src.len(), stack_pointer, true, |frame, offset, chunk| {
        // SAFETY: the mapping is live and the page table lock is held, which
        // eviction needs before it can reuse the frame.
        unsafe { frame.write(offset, &src[chunk]) };
    })
}

/// Fills `dst` from user address `src`.
pub fn copy_from_user(
    spt: &SupplementalPageTable,
    dst: &mut [u8],
    src: usize,
    stack_pointer: usize,
) -> Result<()> {
    let len = dst.len();
    for_each_chunk(spt, src, len, stack_pointer, false, |frame, offset, chunk| {
        // SAFETY: as in `copy_to_user`.
        unsafe { frame.read(offset, &mut dst[chunk]) };
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{BackingFile, MemFile};
    use crate::vm::test_support::{system, STACK_TOP};
    use alloc::sync::Arc;

    const DATA: usize = 0x1000_0000;

    #[test]
    fn pinned_buffer_spans_pages_and_unpins_on_drop() {
        let system = system(4, 8);
        let spt = SupplementalPageTable::new(1, system);
        let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(vec![1; 3 * PAGE_FRAME_SIZE]));
        spt.mmap(file, DATA).unwrap();

        let buf = pin_user_buffer(&spt, DATA + 100, 2 * PAGE_FRAME_SIZE, STACK_TOP, true).unwrap();
        assert_eq!(buf.pages(), 3);
        assert_eq!(buf.len(), 2 * PAGE_FRAME_SIZE);
        let pages = spt.pages();
        assert!(pages.iter().all(|p| p.is_pinned() && p.is_resident()));

        drop(buf);
        assert!(pages.iter().all(|p| !p.is_pinned()));
    }

    #[test]
    fn pinned_pages_are_not_evicted() {
        let system = system(2, 8);
        let spt = SupplementalPageTable::new(1, system);
        let top = STACK_TOP - PAGE_FRAME_SIZE;
        let buf = pin_user_buffer(&spt, top, 16, top, true).unwrap();

        for i in 2..=4 {
            let addr = STACK_TOP - i * PAGE_FRAME_SIZE;
            spt.grow_stack(addr, FaultContext::Interrupt).unwrap();
        }
        assert!(spt.lookup(top).unwrap().is_resident());
        drop(buf);
    }

    #[test]
    fn rejects_bad_buffers() {
        let system = system(4, 8);
        let spt = SupplementalPageTable::new(1, system);
        assert!(matches!(
            pin_user_buffer(&spt, 0, 4, STACK_TOP, false),
            Err(Error::InvalidAccess)
        ));
        assert!(matches!(
            pin_user_buffer(&spt, STACK_TOP - 2, 4, STACK_TOP, false),
            Err(Error::InvalidAccess)
        ));
        assert!(matches!(
            pin_user_buffer(&spt, usize::MAX - 1, 4, STACK_TOP, false),
            Err(Error::InvalidAccess)
        ));
        assert!(matches!(
            pin_user_buffer(&spt, DATA, 4, STACK_TOP, false),
            Err(Error::InvalidAccess)
        ));

        let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(vec![1; 8]));
        spt.register_executable(file, 0, DATA, 8, PAGE_FRAME_SIZE - 8, false)
            .unwrap();
        assert!(matches!(
            pin_user_buffer(&spt, DATA, 4, STACK_TOP, true),
            Err(Error::InvalidAccess)
        ));
        assert_eq!(pin_user_buffer(&spt, DATA, 4, STACK_TOP, false).unwrap().pages(), 1);
    }

    #[test]
    fn empty_buffer_pins_nothing() {
        let system = system(4, 8);
        let spt = SupplementalPageTable::new(1, system);
        let buf = pin_user_buffer(&spt, DATA, 0, STACK_TOP, false).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.pages(), 0);
    }

    #[test]
    fn copies_cross_page_boundaries() {
        let system = system(4, 8);
        let spt = SupplementalPageTable::new(1, system);
        let addr = STACK_TOP - 2 * PAGE_FRAME_SIZE;
        for i in 1..=2 {
            spt.grow_stack(STACK_TOP - i * PAGE_FRAME_SIZE, FaultContext::Interrupt)
                .unwrap();
        }
        let data: Vec<u8> = (0..200).collect();
        let at = addr + PAGE_FRAME_SIZE - 100;
        copy_to_user(&spt, at, &data, addr).unwrap();

        let mut out = vec![0u8; 200];
        copy_from_user(&spt, &mut out, at, addr).unwrap();
        assert_eq!(out, data);
        let pd = spt.page_manager().lock();
        assert!(pd.is_dirty(addr));
        assert!(pd.is_dirty(addr + PAGE_FRAME_SIZE));
    }

    #[test]
    fn copy_grows_stack_near_sp() {
        let system = system(4, 8);
        let spt = SupplementalPageTable::new(1, system);
        let sp = STACK_TOP - 16;
        copy_to_user(&spt, sp - 8, &[7; 8], sp).unwrap();
        assert!(spt.lookup(sp).is_some());
        assert_eq!(spt.len(), 1);
    }
}
