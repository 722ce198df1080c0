//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! Each process owns a [`vm::SupplementalPageTable`] describing where every
//! user page comes from. Page faults are resolved lazily from the program
//! image, a memory-mapped file, or swap; when physical frames run out the
//! global [`vm::FrameTable`] evicts with the clock algorithm.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod system;
pub mod vm;

pub use system::{vm_init, vm_system, VmSystem};
