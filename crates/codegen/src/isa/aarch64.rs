//! AArch64 instruction templates.
//!
//! Register assignment: the cursor lives in `x19` (callee-saved);
//! `x20`/`x21` hold the usable tape bounds when the inline range check is
//! enabled; `w9`/`w10`/`w11` are data scratch, `x12` is the address
//! scratch for out-of-range cell offsets and `x15` carries host call
//! targets. Cell accesses prefer the unsigned-imm12 `ldrb`/`strb` forms,
//! fall back to `ldurb`/`sturb` for small negative offsets, and
//! materialize anything else into `x12`.

use crate::buffer::{CodeBuffer, Label, LabelUse};
use crate::compile::CompileOptions;
use crate::isa::InstEmitter;

const CURSOR: u8 = 19; // x19
const LOW_BOUND: u8 = 20; // x20
const HIGH_BOUND: u8 = 21; // x21
const SCRATCH: u8 = 9; // w9
const SCRATCH2: u8 = 10; // w10
const SCRATCH3: u8 = 11; // w11
const ADDR: u8 = 12; // x12
const CALL_TARGET: u8 = 15; // x15

/// Condition codes for `b.cond`.
const COND_EQ: u32 = 0x0;
const COND_HS: u32 = 0x2;
const COND_LO: u32 = 0x3;

fn reg(r: u8) -> u32 {
    u32::from(r & 31)
}

/// `movz` (64-bit) with halfword `imm` at position `hw`.
fn enc_movz(rd: u8, imm: u16, hw: u32) -> u32 {
    0xd280_0000 | (hw << 21) | (u32::from(imm) << 5) | reg(rd)
}

/// `movn` (64-bit): `rd = !(imm << (hw * 16))`.
fn enc_movn(rd: u8, imm: u16, hw: u32) -> u32 {
    0x9280_0000 | (hw << 21) | (u32::from(imm) << 5) | reg(rd)
}

/// `movk` (64-bit): keep, insert halfword.
fn enc_movk(rd: u8, imm: u16, hw: u32) -> u32 {
    0xf280_0000 | (hw << 21) | (u32::from(imm) << 5) | reg(rd)
}

/// `add`/`sub` (64-bit register form).
fn enc_add_rrr(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8b00_0000 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd)
}

fn enc_sub_rrr(rd: u8, rn: u8, rm: u8) -> u32 {
    0xcb00_0000 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd)
}

/// `subs xzr, rn, rm` -- compare.
fn enc_cmp_rr(rn: u8, rm: u8) -> u32 {
    0xeb00_0000 | (reg(rm) << 16) | (reg(rn) << 5) | 31
}

/// `madd wd, wn, wm, wa`.
fn enc_madd(rd: u8, rn: u8, rm: u8, ra: u8) -> u32 {
    0x1b00_0000 | (reg(rm) << 16) | (reg(ra) << 10) | (reg(rn) << 5) | reg(rd)
}

/// `add wd, wn, wm` (32-bit register form).
fn enc_add_www(rd: u8, rn: u8, rm: u8) -> u32 {
    0x0b00_0000 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd)
}

/// How a cell at some offset from the cursor is addressed.
enum CellAddr {
    /// `[x19, #imm12]` unsigned offset.
    Imm12(u32),
    /// `[x19, #simm9]` unscaled.
    Simm9(i32),
    /// `[x19, x12]` with the offset materialized in `x12`.
    Reg,
}

pub struct AArch64Emitter {
    memory_size: u32,
    memory_offset: u32,
    bounds_checks: bool,
    putchar: usize,
    getchar: usize,
    oob: Option<Label>,
}

impl AArch64Emitter {
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

    /// Materialize `value` into `rd` with the shortest movz/movn + movk
    /// sequence.
    fn load_const(&self, buf: &mut CodeBuffer, rd: u8, value: i64) {
        let value = value as u64;
        let halfwords = [
            (value & 0xffff) as u16,
            ((value >> 16) & 0xffff) as u16,
            ((value >> 32) & 0xffff) as u16,
            ((value >> 48) & 0xffff) as u16,
        ];
        let ones = halfwords.iter().filter(|&&h| h == 0xffff).count();
        let zeros = halfwords.iter().filter(|&&h| h == 0).count();

        let mut first = true;
        if ones > zeros {
            for (i, &h) in halfwords.iter().enumerate() {
                if h == 0xffff {
                    continue;
                }
                if first {
                    buf.put4(enc_movn(rd, !h, i as u32));
                    first = false;
                } else {
                    buf.put4(enc_movk(rd, h, i as u32));
                }
            }
            if first {
                buf.put4(enc_movn(rd, 0, 0));
            }
        } else {
            for (i, &h) in halfwords.iter().enumerate() {
                if h == 0 {
                    continue;
                }
                if first {
                    buf.put4(enc_movz(rd, h, i as u32));
                    first = false;
                } else {
                    buf.put4(enc_movk(rd, h, i as u32));
                }
            }
            if first {
                buf.put4(enc_movz(rd, 0, 0));
            }
        }
    }

    /// Pick an addressing form for `cursor + offset`, materializing the
    /// offset into `x12` when neither immediate form fits.
    fn prepare_addr(&self, buf: &mut CodeBuffer, offset: i32) -> CellAddr {
        if (0..=4095).contains(&offset) {
            CellAddr::Imm12(offset as u32)
        } else if (-256..0).contains(&offset) {
            CellAddr::Simm9(offset)
        } else {
            self.load_const(buf, ADDR, i64::from(offset));
            CellAddr::Reg
        }
    }

    /// `ldrb w<rt>, [x19 + addr]`.
    fn ldrb(&self, buf: &mut CodeBuffer, rt: u8, addr: &CellAddr) {
        let word = match addr {
            CellAddr::Imm12(imm) => 0x3940_0000 | (imm << 10) | (reg(CURSOR) << 5) | reg(rt),
            CellAddr::Simm9(s) => {
                0x3840_0000 | (((*s as u32) & 0x1ff) << 12) | (reg(CURSOR) << 5) | reg(rt)
            }
            CellAddr::Reg => 0x3860_6800 | (reg(ADDR) << 16) | (reg(CURSOR) << 5) | reg(rt),
        };
        buf.put4(word);
    }

    /// `strb w<rt>, [x19 + addr]`.
    fn strb(&self, buf: &mut CodeBuffer, rt: u8, addr: &CellAddr) {
        let word = match addr {
            CellAddr::Imm12(imm) => 0x3900_0000 | (imm << 10) | (reg(CURSOR) << 5) | reg(rt),
            CellAddr::Simm9(s) => {
                0x3800_0000 | (((*s as u32) & 0x1ff) << 12) | (reg(CURSOR) << 5) | reg(rt)
            }
            CellAddr::Reg => 0x3820_6800 | (reg(ADDR) << 16) | (reg(CURSOR) << 5) | reg(rt),
        };
        buf.put4(word);
    }

    fn b_cond(&self, buf: &mut CodeBuffer, cond: u32, target: Label) {
        let site = buf.cur_offset();
        buf.put4(0x5400_0000 | cond);
        buf.use_label_at_offset(site, target, LabelUse::A64Branch19);
    }

    /// `blr x15` at an absolute host address.
    fn call_host(&self, buf: &mut CodeBuffer, addr: usize) {
        self.load_const(buf, CALL_TARGET, addr as i64);
        buf.put4(0xd63f_0000 | (reg(CALL_TARGET) << 5));
    }
}

impl InstEmitter for AArch64Emitter {
    fn prologue(&mut self, buf: &mut CodeBuffer) {
        buf.put4(0xa9bf_7bfd); // stp x29, x30, [sp, #-16]!
        buf.put4(0x9100_03fd); // mov x29, sp
        buf.put4(0xa9bf_53f3); // stp x19, x20, [sp, #-16]!
        buf.put4(0xa9bf_5bf5); // stp x21, x22, [sp, #-16]!
        buf.put4(0xaa00_03f3); // mov x19, x0 -- tape pointer becomes the cursor

        if self.bounds_checks {
            self.oob = Some(buf.get_label());
            // low bound = cursor - memory_offset
            self.load_const(buf, ADDR, i64::from(self.memory_offset));
            buf.put4(enc_sub_rrr(LOW_BOUND, CURSOR, ADDR));
            // high bound = low bound + total usable size
            let total = self.memory_offset + self.memory_size;
            self.load_const(buf, ADDR, i64::from(total));
            buf.put4(enc_add_rrr(HIGH_BOUND, LOW_BOUND, ADDR));
        }
    }

    fn epilogue(&mut self, buf: &mut CodeBuffer) {
        buf.put4(0x5280_0000); // mov w0, #0
        buf.put4(0xa8c1_5bf5); // ldp x21, x22, [sp], #16
        buf.put4(0xa8c1_53f3); // ldp x19, x20, [sp], #16
        buf.put4(0xa8c1_7bfd); // ldp x29, x30, [sp], #16
        buf.put4(0xd65f_03c0); // ret

        if let Some(oob) = self.oob {
            buf.bind_label(oob);
            buf.put4(0xd420_0000); // brk #0
        }
    }

    fn move_ptr(&mut self, buf: &mut CodeBuffer, count: i32) {
        if (0..4096).contains(&count) {
            // add x19, x19, #count
            buf.put4(0x9100_0000 | ((count as u32) << 10) | (reg(CURSOR) << 5) | reg(CURSOR));
        } else if (-4095..0).contains(&count) {
            // sub x19, x19, #-count
            buf.put4(0xd100_0000 | ((count.unsigned_abs()) << 10) | (reg(CURSOR) << 5) | reg(CURSOR));
        } else {
            self.load_const(buf, ADDR, i64::from(count));
            buf.put4(enc_add_rrr(CURSOR, CURSOR, ADDR));
        }

        if let Some(oob) = self.oob {
            buf.put4(enc_cmp_rr(CURSOR, LOW_BOUND));
            self.b_cond(buf, COND_LO, oob);
            buf.put4(enc_cmp_rr(CURSOR, HIGH_BOUND));
            self.b_cond(buf, COND_HS, oob);
        }
    }

    fn add_val(&mut self, buf: &mut CodeBuffer, count: i32, offset: i32) {
        let addr = self.prepare_addr(buf, offset);
        self.ldrb(buf, SCRATCH, &addr);
        // add w9, w9, #count (mod 256; the store truncates)
        let imm = (count & 0xff) as u32;
        buf.put4(0x1100_0000 | (imm << 10) | (reg(SCRATCH) << 5) | reg(SCRATCH));
        self.strb(buf, SCRATCH, &addr);
    }

    fn output(&mut self, buf: &mut CodeBuffer, offset: i32) {
        let addr = self.prepare_addr(buf, offset);
        self.ldrb(buf, 0, &addr); // w0 carries the argument
        self.call_host(buf, self.putchar);
    }

    fn input(&mut self, buf: &mut CodeBuffer, offset: i32) {
        self.call_host(buf, self.getchar);
        // cmn w0, #1; b.eq past the store -- EOF leaves the cell alone
        buf.put4(0x3100_041f);
        let skip = buf.get_label();
        self.b_cond(buf, COND_EQ, skip);
        let addr = self.prepare_addr(buf, offset);
        self.strb(buf, 0, &addr);
        buf.bind_label(skip);
    }

    fn set_const(&mut self, buf: &mut CodeBuffer, value: i32, offset: i32) {
        let addr = self.prepare_addr(buf, offset);
        // movz w9, #value (mod 256)
        buf.put4(0x5280_0000 | (((value & 0xff) as u32) << 5) | reg(SCRATCH));
        self.strb(buf, SCRATCH, &addr);
    }

    fn mul(&mut self, buf: &mut CodeBuffer, multiplier: i32, src_offset: i32, dst_offset: i32) {
        let src = self.prepare_addr(buf, src_offset);
        self.ldrb(buf, SCRATCH, &src);
        // movz w10, #multiplier (mod 256; only the low byte of the
        // product survives the store)
        buf.put4(0x5280_0000 | (((multiplier & 0xff) as u32) << 5) | reg(SCRATCH2));
        let dst = self.prepare_addr(buf, dst_offset);
        self.ldrb(buf, SCRATCH3, &dst);
        buf.put4(enc_madd(SCRATCH, SCRATCH, SCRATCH2, SCRATCH3));
        self.strb(buf, SCRATCH, &dst);
    }

    fn copy_cell(&mut self, buf: &mut CodeBuffer, src_offset: i32, dst_offset: i32) {
        let src = self.prepare_addr(buf, src_offset);
        self.ldrb(buf, SCRATCH, &src);
        let dst = self.prepare_addr(buf, dst_offset);
        self.ldrb(buf, SCRATCH3, &dst);
        buf.put4(enc_add_www(SCRATCH, SCRATCH, SCRATCH3));
        self.strb(buf, SCRATCH, &dst);
    }

    fn branch_if_zero(&mut self, buf: &mut CodeBuffer, target: Label) {
        self.ldrb(buf, SCRATCH, &CellAddr::Imm12(0));
        let site = buf.cur_offset();
        buf.put4(0x3400_0000 | reg(SCRATCH)); // cbz w9, target
        buf.use_label_at_offset(site, target, LabelUse::A64Branch19);
    }

    fn branch_if_nonzero(&mut self, buf: &mut CodeBuffer, target: Label) {
        self.ldrb(buf, SCRATCH, &CellAddr::Imm12(0));
        let site = buf.cur_offset();
        buf.put4(0x3500_0000 | reg(SCRATCH)); // cbnz w9, target
        buf.use_label_at_offset(site, target, LabelUse::A64Branch19);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompileOptions, HostFuncs};

    fn emitter(bounds_checks: bool) -> AArch64Emitter {
        AArch64Emitter::new(&CompileOptions {
            memory_size: 61_440,
            memory_offset: 4096,
            bounds_checks,
            profiling: false,
            host: HostFuncs {
                putchar: 0x1122_3344_5566_7788,
                getchar: 0x8877_6655_4433_2211,
            },
        })
    }

    fn words(f: impl FnOnce(&mut AArch64Emitter, &mut CodeBuffer)) -> Vec<u32> {
        let mut isa = emitter(false);
        let mut buf = CodeBuffer::new();
        f(&mut isa, &mut buf);
        buf.finish()
            .unwrap()
            .bytes()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn move_ptr_uses_immediate_adds_when_possible() {
        assert_eq!(words(|isa, buf| isa.move_ptr(buf, 1)), vec![0x9100_0673]);
        assert_eq!(words(|isa, buf| isa.move_ptr(buf, -1)), vec![0xd100_0673]);
        // Out-of-range counts go through x12.
        assert_eq!(
            words(|isa, buf| isa.move_ptr(buf, 100_000)),
            vec![
                0xd280_0000 | (0x86a0 << 5) | 12, // movz x12, #0x86a0
                0xf280_0000 | (1 << 21) | (0x1 << 5) | 12, // movk x12, #1, lsl #16
                0x8b00_0000 | (12 << 16) | (19 << 5) | 19, // add x19, x19, x12
            ]
        );
    }

    #[test]
    fn add_val_round_trips_through_w9() {
        assert_eq!(
            words(|isa, buf| isa.add_val(buf, 1, 0)),
            vec![
                0x3940_0269, // ldrb w9, [x19]
                0x1100_0529, // add w9, w9, #1
                0x3900_0269, // strb w9, [x19]
            ]
        );
        // -1 becomes an add of 255: only the stored byte matters.
        assert_eq!(
            words(|isa, buf| isa.add_val(buf, -1, 0)),
            vec![0x3940_0269, 0x1103_fd29, 0x3900_0269]
        );
    }

    #[test]
    fn small_negative_offsets_use_the_unscaled_forms() {
        assert_eq!(
            words(|isa, buf| isa.add_val(buf, 1, -1)),
            vec![
                0x385f_f269, // ldurb w9, [x19, #-1]
                0x1100_0529, // add w9, w9, #1
                0x381f_f269, // sturb w9, [x19, #-1]
            ]
        );
    }

    #[test]
    fn large_offsets_materialize_into_x12() {
        let w = words(|isa, buf| isa.add_val(buf, 1, 5000));
        assert_eq!(w.len(), 4);
        assert_eq!(w[0], 0xd280_0000 | (5000 << 5) | 12); // movz x12, #5000
        assert_eq!(w[1], 0x3860_6800 | (12 << 16) | (19 << 5) | 9); // ldrb w9, [x19, x12]
        assert_eq!(w[3], 0x3820_6800 | (12 << 16) | (19 << 5) | 9); // strb w9, [x19, x12]
    }

    #[test]
    fn set_const_truncates_to_a_byte() {
        assert_eq!(
            words(|isa, buf| isa.set_const(buf, 300, 0)),
            vec![
                0x5280_0000 | (44 << 5) | 9, // movz w9, #44
                0x3900_0269,                 // strb w9, [x19]
            ]
        );
    }

    #[test]
    fn mul_accumulates_with_madd() {
        assert_eq!(
            words(|isa, buf| isa.mul(buf, 2, 0, 1)),
            vec![
                0x3940_0269,                // ldrb w9, [x19]
                0x5280_0000 | (2 << 5) | 10, // movz w10, #2
                0x3940_066b,                // ldrb w11, [x19, #1]
                0x1b0a_2d29,                // madd w9, w9, w10, w11
                0x3900_0669,                // strb w9, [x19, #1]
            ]
        );
    }

    #[test]
    fn copy_cell_skips_the_multiply() {
        assert_eq!(
            words(|isa, buf| isa.copy_cell(buf, 0, 2)),
            vec![
                0x3940_0269, // ldrb w9, [x19]
                0x3940_0a6b, // ldrb w11, [x19, #2]
                0x0b0b_0129, // add w9, w9, w11
                0x3900_0a69, // strb w9, [x19, #2]
            ]
        );
    }

    #[test]
    fn loop_branches_are_cbz_cbnz_on_the_current_cell() {
        let mut isa = emitter(false);
        let mut buf = CodeBuffer::new();
        let top = buf.get_label();
        buf.bind_label(top);
        isa.branch_if_nonzero(&mut buf, top);
        let code = buf.finish().unwrap();
        let w: Vec<u32> = code
            .bytes()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(w[0], 0x3940_0269); // ldrb w9, [x19]
        // cbnz w9 back one word: imm19 = -1.
        assert_eq!(w[1], 0x3500_0000 | ((0x7ffff & -1i32 as u32) << 5) | 9);
    }

    #[test]
    fn call_sequence_materializes_the_host_address() {
        let w = words(|isa, buf| isa.output(buf, 0));
        assert_eq!(w[0], 0x3940_0260); // ldrb w0, [x19]
        assert_eq!(w[1], 0xd280_0000 | (0x7788 << 5) | 15); // movz x15, #0x7788
        assert_eq!(w[2], 0xf280_0000 | (1 << 21) | (0x5566 << 5) | 15);
        assert_eq!(w[3], 0xf280_0000 | (2 << 21) | (0x3344 << 5) | 15);
        assert_eq!(w[4], 0xf280_0000 | (3 << 21) | (0x1122 << 5) | 15);
        assert_eq!(w[5], 0xd63f_0000 | (15 << 5)); // blr x15
    }

    #[test]
    fn input_skips_the_store_on_eof() {
        let w = words(|isa, buf| isa.input(buf, 0));
        let n = w.len();
        assert_eq!(w[n - 3], 0x3100_041f); // cmn w0, #1
        // b.eq over the store: one word for strb, so two words forward.
        assert_eq!(w[n - 2], 0x5400_0000 | (2 << 5) | COND_EQ);
        assert_eq!(w[n - 1], 0x3900_0260); // strb w0, [x19]
    }

    #[test]
    fn negative_constants_materialize_via_movn() {
        let mut isa = emitter(false);
        let mut buf = CodeBuffer::new();
        isa.load_const(&mut buf, 12, -5000);
        let code = buf.finish().unwrap();
        let word = u32::from_le_bytes(code.bytes()[0..4].try_into().unwrap());
        // movn x12, #!( -5000 as u16 ) => register holds 0xffff...ec78
        assert_eq!(word, 0x9280_0000 | (u32::from(!(-5000i64 as u16)) << 5) | 12);
        assert_eq!(code.len(), 4);
    }

    #[test]
    fn prologue_saves_the_frame_and_loads_the_cursor() {
        assert_eq!(
            words(|isa, buf| isa.prologue(buf)),
            vec![
                0xa9bf_7bfd, // stp x29, x30, [sp, #-16]!
                0x9100_03fd, // mov x29, sp
                0xa9bf_53f3, // stp x19, x20, [sp, #-16]!
                0xa9bf_5bf5, // stp x21, x22, [sp, #-16]!
                0xaa00_03f3, // mov x19, x0
            ]
        );
    }

    #[test]
    fn safe_prologue_derives_the_tape_bounds() {
        let mut isa = emitter(true);
        let mut buf = CodeBuffer::new();
        isa.prologue(&mut buf);
        isa.epilogue(&mut buf);
        let code = buf.finish().unwrap();
        let w: Vec<u32> = code
            .bytes()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(w[5], 0xd280_0000 | (4096 << 5) | 12); // movz x12, #4096
        assert_eq!(w[6], 0xcb0c_0274); // sub x20, x19, x12
        assert_eq!(w[7], 0xd280_0000 | (1 << 21) | (1 << 5) | 12); // movz x12, #1, lsl #16
        assert_eq!(w[8], 0x8b0c_0295); // add x21, x20, x12
    }

    #[test]
    fn epilogue_restores_in_reverse_and_returns_zero() {
        assert_eq!(
            words(|isa, buf| isa.epilogue(buf)),
            vec![
                0x5280_0000, // mov w0, #0
                0xa8c1_5bf5, // ldp x21, x22, [sp], #16
                0xa8c1_53f3, // ldp x19, x20, [sp], #16
                0xa8c1_7bfd, // ldp x29, x30, [sp], #16
                0xd65f_03c0, // ret
            ]
        );
    }

    #[test]
    fn forward_loop_branch_skips_the_body() {
        let mut isa = emitter(false);
        let mut buf = CodeBuffer::new();
        let end = buf.get_label();
        isa.branch_if_zero(&mut buf, end);
        isa.add_val(&mut buf, 1, 0);
        buf.bind_label(end);
        let code = buf.finish().unwrap();
        let w: Vec<u32> = code
            .bytes()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // cbz over the three add_val words: four words forward.
        assert_eq!(w[1], 0x3400_0000 | (4 << 5) | 9);
    }

    #[test]
    fn output_at_a_negative_offset_uses_the_unscaled_load() {
        let w = words(|isa, buf| isa.output(buf, -3));
        assert_eq!(w[0], 0x3840_0000 | ((0x1fd) << 12) | (19 << 5)); // ldurb w0, [x19, #-3]
    }

    #[test]
    fn safe_mode_brackets_moves_with_range_checks() {
        let mut isa = emitter(true);
        let mut buf = CodeBuffer::new();
        isa.prologue(&mut buf);
        let start = buf.cur_offset() as usize;
        isa.move_ptr(&mut buf, 1);
        isa.epilogue(&mut buf);
        let code = buf.finish().unwrap();
        let w: Vec<u32> = code.bytes()[start..]
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(w[0], 0x9100_0673); // add x19, x19, #1
        assert_eq!(w[1], 0xeb14_027f); // cmp x19, x20
        assert_eq!(w[3], 0xeb15_027f); // cmp x19, x21
        // The trap tail is the last word emitted.
        let last = u32::from_le_bytes(code.bytes()[code.len() - 4..].try_into().unwrap());
        assert_eq!(last, 0xd420_0000); // brk #0
    }
}
