//! Native code generation for the `bf` compiler.
//!
//! The crate is split the way a larger code generator would be: an
//! architecture-neutral [`CodeBuffer`] that collects bytes and resolves
//! PC-labels, per-ISA instruction emitters behind the [`isa::InstEmitter`]
//! trait, a compile driver that walks the IR, and a [`DebugMap`] that ties
//! emitted code offsets back to IR nodes for the profiler.

pub mod buffer;
pub mod compile;
pub mod debug;
pub mod isa;

pub use buffer::{CodeBuffer, FinishedCode, Label, LabelUse};
pub use compile::{CompileOptions, CompiledProgram, HostFuncs, compile};
pub use debug::{DebugEntry, DebugMap};

use thiserror::Error;

/// A fatal code generation failure. No partial code is ever made
/// executable; the driver aborts on the first of these.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("label {label} used at offset {offset:#x} was never bound")]
    UnboundLabel { label: u32, offset: u32 },
    #[error("branch at offset {offset:#x} cannot encode displacement {displacement}")]
    BranchOutOfRange { offset: u32, displacement: i64 },
    #[error("no instruction emitter for the host architecture `{arch}`")]
    UnsupportedHost { arch: &'static str },
}
