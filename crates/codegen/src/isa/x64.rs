//! x86-64 instruction templates.
//!
//! Register assignment: the cursor lives in `r12` (callee-saved, and its
//! SIB-encoded addressing keeps every cell access to one instruction);
//! `r13`/`r14` hold the usable tape bounds when the inline range check is
//! enabled; `rax` is the scratch/accumulator and `edi` carries the host
//! call argument. Cell accesses use `[r12 + disp]` with the shortest
//! displacement that fits.

use crate::buffer::{CodeBuffer, Label, LabelUse};
use crate::compile::CompileOptions;
use crate::isa::InstEmitter;

/// Condition codes for `jcc` (0x0f 0x8X).
const CC_B: u8 = 0x2;
const CC_AE: u8 = 0x3;
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;

/// Encode the ModR/M byte.
#[inline]
fn encode_modrm(m0d: u8, reg: u8, rm: u8) -> u8 {
    debug_assert!(m0d < 4 && reg < 8 && rm < 8);
    (m0d << 6) | (reg << 3) | rm
}

/// Encode the SIB byte (scale-index-base).
#[inline]
fn encode_sib(scale: u8, index: u8, base: u8) -> u8 {
    debug_assert!(scale < 4 && index < 8 && base < 8);
    (scale << 6) | (index << 3) | base
}

pub struct X64Emitter {
    memory_size: u32,
    memory_offset: u32,
    bounds_checks: bool,
    putchar: usize,
    getchar: usize,
    /// Shared trap tail for failed range checks; allocated in the
    /// prologue, bound in the epilogue.
    oob: Option<Label>,
}

impl X64Emitter {
    pub fn new(options: &CompileOptions) -> Self {
        Self {
            memory_size: options.memory_size,
            memory_offset: options.memory_offset,
            bounds_checks: options.bounds_checks,
            putchar: options.host.putchar,
            getchar: options.host.getchar,
            oob: None,
        }
    }

    /// ModR/M + SIB + displacement for `[r12 + disp]`. `reg` is the /r
    /// field (a register number 0-7 or an opcode extension). The caller
    /// emits the REX prefix; `r12` as base always needs REX.B.
    fn mem_r12(&self, buf: &mut CodeBuffer, reg: u8, disp: i32) {
        if disp == 0 {
            buf.put1(encode_modrm(0b00, reg, 0b100));
            buf.put1(encode_sib(0, 0b100, 0b100));
        } else if let Ok(d8) = i8::try_from(disp) {
            buf.put1(encode_modrm(0b01, reg, 0b100));
            buf.put1(encode_sib(0, 0b100, 0b100));
            buf.put1(d8 as u8);
        } else {
            buf.put1(encode_modrm(0b10, reg, 0b100));
            buf.put1(encode_sib(0, 0b100, 0b100));
            buf.put4(disp as u32);
        }
    }

    /// `movzx eax/edi, byte [r12 + disp]`.
    fn movzx_from_cell(&self, buf: &mut CodeBuffer, reg: u8, disp: i32) {
        buf.put1(0x41);
        buf.put1(0x0f);
        buf.put1(0xb6);
        self.mem_r12(buf, reg, disp);
    }

    /// `mov rax, imm64; call rax`.
    fn call_host(&self, buf: &mut CodeBuffer, addr: usize) {
        buf.put1(0x48);
        buf.put1(0xb8);
        buf.put8(addr as u64);
        buf.put1(0xff);
        buf.put1(0xd0);
    }

    fn jcc(&self, buf: &mut CodeBuffer, cc: u8, target: Label) {
        buf.put1(0x0f);
        buf.put1(0x80 | cc);
        let site = buf.cur_offset();
        buf.put4(0);
        buf.use_label_at_offset(site, target, LabelUse::X64JmpRel32);
    }

    /// `cmp byte [r12], 0`.
    fn test_current_cell(&self, buf: &mut CodeBuffer) {
        buf.put1(0x41);
        buf.put1(0x80);
        self.mem_r12(buf, 7, 0);
        buf.put1(0x00);
    }
}

impl InstEmitter for X64Emitter {
    fn prologue(&mut self, buf: &mut CodeBuffer) {
        // push rbp; mov rbp, rsp
        buf.put1(0x55);
        buf.put1(0x48);
        buf.put1(0x89);
        buf.put1(0xe5);
        // push r12; push r13; push r14; push rbx
        // (five pushes total keep rsp 16-byte aligned at call sites)
        buf.put1(0x41);
        buf.put1(0x54);
        buf.put1(0x41);
        buf.put1(0x55);
        buf.put1(0x41);
        buf.put1(0x56);
        buf.put1(0x53);
        // mov r12, rdi -- the tape pointer becomes the cursor
        buf.put1(0x49);
        buf.put1(0x89);
        buf.put1(0xfc);

        if self.bounds_checks {
            self.oob = Some(buf.get_label());
            // lea r13, [r12 - memory_offset] -- low bound of the tape
            buf.put1(0x4d);
            buf.put1(0x8d);
            buf.put1(0xac);
            buf.put1(0x24);
            buf.put4((self.memory_offset as i32).wrapping_neg() as u32);
            // lea r14, [r13 + total] -- one past the high bound
            let total = self.memory_offset + self.memory_size;
            buf.put1(0x4d);
            buf.put1(0x8d);
            buf.put1(0xb5);
            buf.put4(total);
        }
    }

    fn epilogue(&mut self, buf: &mut CodeBuffer) {
        // xor eax, eax -- the entry function returns 0
        buf.put1(0x31);
        buf.put1(0xc0);
        // pop rbx; pop r14; pop r13; pop r12; pop rbp; ret
        buf.put1(0x5b);
        buf.put1(0x41);
        buf.put1(0x5e);
        buf.put1(0x41);
        buf.put1(0x5d);
        buf.put1(0x41);
        buf.put1(0x5c);
        buf.put1(0x5d);
        buf.put1(0xc3);

        if let Some(oob) = self.oob {
            // Range-check failures land here, past the return.
            buf.bind_label(oob);
            buf.put1(0x0f);
            buf.put1(0x0b); // ud2
        }
    }

    fn move_ptr(&mut self, buf: &mut CodeBuffer, count: i32) {
        // add r12, imm
        buf.put1(0x49);
        if let Ok(imm8) = i8::try_from(count) {
            buf.put1(0x83);
            buf.put1(0xc4);
            buf.put1(imm8 as u8);
        } else {
            buf.put1(0x81);
            buf.put1(0xc4);
            buf.put4(count as u32);
        }

        if let Some(oob) = self.oob {
            // cmp r12, r13; jb oob
            buf.put1(0x4d);
            buf.put1(0x39);
            buf.put1(0xec);
            self.jcc(buf, CC_B, oob);
            // cmp r12, r14; jae oob
            buf.put1(0x4d);
            buf.put1(0x39);
            buf.put1(0xf4);
            self.jcc(buf, CC_AE, oob);
        }
    }

    fn add_val(&mut self, buf: &mut CodeBuffer, count: i32, offset: i32) {
        // add byte [r12 + offset], imm8
        buf.put1(0x41);
        buf.put1(0x80);
        self.mem_r12(buf, 0, offset);
        buf.put1((count & 0xff) as u8);
    }

    fn output(&mut self, buf: &mut CodeBuffer, offset: i32) {
        // movzx edi, byte [r12 + offset]
        self.movzx_from_cell(buf, 7, offset);
        self.call_host(buf, self.putchar);
    }

    fn input(&mut self, buf: &mut CodeBuffer, offset: i32) {
        self.call_host(buf, self.getchar);
        // test eax, eax; js past the store -- EOF leaves the cell alone
        buf.put1(0x85);
        buf.put1(0xc0);
        buf.put1(0x78);
        buf.put1(0x08);
        // mov byte [r12 + offset], al (disp32 form, fixed 8-byte length)
        buf.put1(0x41);
        buf.put1(0x88);
        buf.put1(encode_modrm(0b10, 0, 0b100));
        buf.put1(encode_sib(0, 0b100, 0b100));
        buf.put4(offset as u32);
    }

    fn set_const(&mut self, buf: &mut CodeBuffer, value: i32, offset: i32) {
        // mov byte [r12 + offset], imm8
        buf.put1(0x41);
        buf.put1(0xc6);
        self.mem_r12(buf, 0, offset);
        buf.put1((value & 0xff) as u8);
    }

    fn mul(&mut self, buf: &mut CodeBuffer, multiplier: i32, src_offset: i32, dst_offset: i32) {
        // movzx eax, byte [r12 + src]
        self.movzx_from_cell(buf, 0, src_offset);
        // imul eax, eax, imm
        if let Ok(imm8) = i8::try_from(multiplier) {
            buf.put1(0x6b);
            buf.put1(0xc0);
            buf.put1(imm8 as u8);
        } else {
            buf.put1(0x69);
            buf.put1(0xc0);
            buf.put4(multiplier as u32);
        }
        // add byte [r12 + dst], al
        buf.put1(0x41);
        buf.put1(0x00);
        self.mem_r12(buf, 0, dst_offset);
    }

    fn copy_cell(&mut self, buf: &mut CodeBuffer, src_offset: i32, dst_offset: i32) {
        // movzx eax, byte [r12 + src]; add byte [r12 + dst], al
        self.movzx_from_cell(buf, 0, src_offset);
        buf.put1(0x41);
        buf.put1(0x00);
        self.mem_r12(buf, 0, dst_offset);
    }

    fn branch_if_zero(&mut self, buf: &mut CodeBuffer, target: Label) {
        self.test_current_cell(buf);
        self.jcc(buf, CC_E, target);
    }

    fn branch_if_nonzero(&mut self, buf: &mut CodeBuffer, target: Label) {
        self.test_current_cell(buf);
        self.jcc(buf, CC_NE, target);
    }
}
