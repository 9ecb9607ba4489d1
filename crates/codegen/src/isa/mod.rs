//! Per-ISA instruction emitters.
//!
//! Each back end implements [`InstEmitter`]: one method per IR operation,
//! plus the prologue/epilogue framing and the conditional branches the
//! compile driver strings loops together with. The contract for every
//! method is stated in terms of the tape and cursor; the opcode bytes are
//! the back end's business.

pub mod aarch64;
pub mod x64;

use crate::CodegenError;
use crate::buffer::{CodeBuffer, Label};
use crate::compile::CompileOptions;

/// Architecture-specific lowering of the IR node templates.
///
/// The cursor lives in a callee-saved register chosen by the back end and
/// always holds a host pointer into the tape. Cell arithmetic is wrapping
/// byte arithmetic; offsets are signed cell counts.
pub trait InstEmitter {
    /// Set up the ABI frame, load the tape pointer from the first argument
    /// register into the cursor and, when bounds checks are enabled,
    /// derive the usable tape range.
    fn prologue(&mut self, buf: &mut CodeBuffer);

    /// Restore the ABI frame and return 0. Also emits the shared
    /// out-of-bounds trap tail when bounds checks are enabled.
    fn epilogue(&mut self, buf: &mut CodeBuffer);

    /// `cursor += count`, plus the inline range check in safe mode.
    fn move_ptr(&mut self, buf: &mut CodeBuffer, count: i32);

    /// `tape[cursor + offset] += count` (wrapping).
    fn add_val(&mut self, buf: &mut CodeBuffer, count: i32, offset: i32);

    /// Call the host `putchar` with `tape[cursor + offset]`.
    fn output(&mut self, buf: &mut CodeBuffer, offset: i32);

    /// Call the host `getchar`; a negative result (EOF) leaves the cell
    /// unchanged, otherwise the low byte is stored to
    /// `tape[cursor + offset]`.
    fn input(&mut self, buf: &mut CodeBuffer, offset: i32);

    /// `tape[cursor + offset] = value` (truncated to a byte).
    fn set_const(&mut self, buf: &mut CodeBuffer, value: i32, offset: i32);

    /// `tape[cursor + dst] += multiplier * tape[cursor + src]` (wrapping).
    fn mul(&mut self, buf: &mut CodeBuffer, multiplier: i32, src_offset: i32, dst_offset: i32);

    /// `tape[cursor + dst] += tape[cursor + src]` (wrapping).
    fn copy_cell(&mut self, buf: &mut CodeBuffer, src_offset: i32, dst_offset: i32);

    /// Branch to `target` when `tape[cursor]` is zero (loop head).
    fn branch_if_zero(&mut self, buf: &mut CodeBuffer, target: Label);

    /// Branch to `target` when `tape[cursor]` is nonzero (loop tail).
    fn branch_if_nonzero(&mut self, buf: &mut CodeBuffer, target: Label);
}

/// The emitter for the architecture this process runs on.
#[cfg(target_arch = "x86_64")]
pub fn host_emitter(options: &CompileOptions) -> Result<Box<dyn InstEmitter>, CodegenError> {
    Ok(Box::new(x64::X64Emitter::new(options)))
}

/// The emitter for the architecture this process runs on.
#[cfg(target_arch = "aarch64")]
pub fn host_emitter(options: &CompileOptions) -> Result<Box<dyn InstEmitter>, CodegenError> {
    Ok(Box::new(aarch64::AArch64Emitter::new(options)))
}

/// The emitter for the architecture this process runs on.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn host_emitter(options: &CompileOptions) -> Result<Box<dyn InstEmitter>, CodegenError> {
    let _ = options;
    Err(CodegenError::UnsupportedHost {
        arch: std::env::consts::ARCH,
    })
}
