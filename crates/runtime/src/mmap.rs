//! A minimal RAII wrapper over anonymous private mappings.

use std::ffi::c_void;
use std::ptr;

use anyhow::{Context, Result};
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags, mmap_anonymous, mprotect, munmap};

/// An anonymous private mapping, unmapped on drop.
pub(crate) struct Mmap {
    ptr: *mut c_void,
    len: usize,
}

impl Mmap {
    /// Map `len` bytes with the given initial protection. `len` must be
    /// page-aligned.
    pub fn new(len: usize, prot: ProtFlags) -> Result<Self> {
        let ptr = unsafe {
            mmap_anonymous(ptr::null_mut(), len, prot, MapFlags::PRIVATE)
                .context("anonymous mmap failed")?
        };
        Ok(Self { ptr, len })
    }

    /// Change the protection of `len` bytes starting `offset` bytes into
    /// the mapping. Both must be page-aligned.
    pub fn protect(&self, offset: usize, len: usize, flags: MprotectFlags) -> Result<()> {
        assert!(offset + len <= self.len);
        unsafe {
            mprotect(self.ptr.add(offset), len, flags).context("mprotect failed")?;
        }
        Ok(())
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // Failure here leaks address space; there is nobody to report to.
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}
