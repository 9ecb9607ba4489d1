//! The guard-paged tape.
//!
//! Layout: one inaccessible page, the usable cells rounded up to a page
//! multiple, one inaccessible page. The whole span is reserved with no
//! access and only the middle window is made read-write, so a cursor that
//! runs off either end faults on the exact misbehaving instruction.

use anyhow::{Result, ensure};
use rustix::mm::{MprotectFlags, ProtFlags};

use crate::mmap::Mmap;

pub struct Tape {
    map: Mmap,
    page_size: usize,
    memory_offset: usize,
}

impl Tape {
    /// Allocate a tape of `size` cells with the entry cursor `memory_offset`
    /// cells into it.
    pub fn allocate(size: usize, memory_offset: usize) -> Result<Self> {
        ensure!(
            memory_offset < size,
            "memory offset {memory_offset} must be smaller than the tape size {size}"
        );
        let page_size = rustix::param::page_size();
        let usable = size.next_multiple_of(page_size);
        let map = Mmap::new(page_size + usable + page_size, ProtFlags::empty())?;
        map.protect(
            page_size,
            usable,
            MprotectFlags::READ | MprotectFlags::WRITE,
        )?;
        log::debug!(
            "tape: {usable} usable bytes at {:#x}, guard pages of {page_size}",
            map.as_ptr() as usize + page_size
        );
        Ok(Self {
            map,
            page_size,
            memory_offset,
        })
    }

    /// The pointer handed to the compiled entry function:
    /// `memory_offset` cells past the start of the usable window.
    pub fn entry_ptr(&self) -> *mut u8 {
        unsafe { self.map.as_mut_ptr().add(self.page_size + self.memory_offset) }
    }

    /// Start of the usable (non-guard) window.
    pub fn usable_base(&self) -> *mut u8 {
        unsafe { self.map.as_mut_ptr().add(self.page_size) }
    }
}
