//! Executable code memory.
//!
//! The mapping has exactly two states, modeled as two types: a writable
//! [`CodeMemory`] the encoded bytes are copied into, and the read-execute
//! [`ExecutableCode`] that [`CodeMemory::publish`] turns it into. There is
//! no way back, so code can never be patched after it became executable.

use anyhow::Result;
use rustix::mm::{MprotectFlags, ProtFlags};

use crate::mmap::Mmap;

/// A read-write anonymous mapping holding not-yet-executable code.
pub struct CodeMemory {
    map: Mmap,
    code_len: usize,
}

impl CodeMemory {
    /// Map a fresh region and copy `bytes` into it.
    pub fn map(bytes: &[u8]) -> Result<Self> {
        let page = rustix::param::page_size();
        let len = bytes.len().next_multiple_of(page).max(page);
        let map = Mmap::new(len, ProtFlags::READ | ProtFlags::WRITE)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), map.as_mut_ptr(), bytes.len());
        }
        Ok(Self {
            map,
            code_len: bytes.len(),
        })
    }

    /// Seal the mapping read-execute and flush the instruction cache.
    pub fn publish(self) -> Result<ExecutableCode> {
        self.map
            .protect(0, self.map.len(), MprotectFlags::READ | MprotectFlags::EXEC)?;
        flush_icache(self.map.as_ptr() as usize, self.code_len);
        log::debug!(
            "published {} bytes of code at {:#x}",
            self.code_len,
            self.map.as_ptr() as usize
        );
        Ok(ExecutableCode {
            map: self.map,
            code_len: self.code_len,
        })
    }
}

/// A sealed read-execute mapping.
pub struct ExecutableCode {
    map: Mmap,
    code_len: usize,
}

impl ExecutableCode {
    /// Address of the first instruction.
    pub fn code_start(&self) -> usize {
        self.map.as_ptr() as usize
    }

    /// One past the last encoded byte.
    pub fn code_end(&self) -> usize {
        self.code_start() + self.code_len
    }

    /// Call the compiled entry function.
    ///
    /// # Safety
    ///
    /// The mapping must hold a complete function for the host architecture
    /// following the `fn(tape_ptr) -> i32` convention, and `tape_ptr` must
    /// point into a tape laid out the way the code was compiled for.
    pub unsafe fn invoke(&self, tape_ptr: *mut u8) -> i32 {
        let entry: extern "C" fn(*mut u8) -> i32 =
            unsafe { std::mem::transmute(self.map.as_ptr()) };
        entry(tape_ptr)
    }
}

/// Bring the instruction cache in sync with the freshly written code.
///
/// x86-64 keeps its caches coherent on its own; AArch64 needs the
/// clean-to-point-of-unification / invalidate dance.
#[cfg(target_arch = "aarch64")]
fn flush_icache(start: usize, len: usize) {
    use std::arch::asm;
    if len == 0 {
        return;
    }
    unsafe {
        let ctr: u64;
        asm!("mrs {}, ctr_el0", out(reg) ctr);
        let dline = 4usize << ((ctr >> 16) & 0xf);
        let iline = 4usize << (ctr & 0xf);
        let end = start + len;

        let mut addr = start & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr);
            addr += dline;
        }
        asm!("dsb ish");

        let mut addr = start & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr);
            addr += iline;
        }
        asm!("dsb ish");
        asm!("isb");
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: usize, _len: usize) {}
