//! The compile driver: IR tree in, finished code and debug map out.

use bf_ir::{MAX_NESTING, Node, NodeKind, Program};

use crate::CodegenError;
use crate::buffer::{CodeBuffer, FinishedCode};
use crate::debug::DebugMap;
use crate::isa::InstEmitter;

/// Host functions the emitted code calls by absolute address.
#[derive(Clone, Copy, Debug)]
pub struct HostFuncs {
    pub putchar: usize,
    pub getchar: usize,
}

/// Everything the back ends need to know besides the IR itself.
#[derive(Clone, Copy, Debug)]
pub struct CompileOptions {
    /// Usable tape cells ahead of the entry pointer
    /// (configured size minus the initial cursor offset).
    pub memory_size: u32,
    /// Usable tape cells behind the entry pointer.
    pub memory_offset: u32,
    /// Emit the inline cursor range check after every `MovePtr`.
    pub bounds_checks: bool,
    /// Bind a debug label per IR node and fill the debug map.
    pub profiling: bool,
    pub host: HostFuncs,
}

/// The output of a compilation: encoded bytes with resolved labels, and
/// the (possibly empty) debug map.
pub struct CompiledProgram {
    pub code: FinishedCode,
    pub debug: DebugMap,
}

/// Lower `program` through `isa` into executable-ready bytes.
///
/// Emission order is prologue, the node walk (loops recursing), epilogue.
/// Label resolution happens inside [`CodeBuffer::finish`], before anything
/// can read the bytes; the debug map is resolved from the finished label
/// table immediately after.
pub fn compile(
    program: &Program,
    isa: &mut dyn InstEmitter,
    options: &CompileOptions,
) -> Result<CompiledProgram, CodegenError> {
    let mut buf = CodeBuffer::new();
    let mut reserve = 2 * MAX_NESTING;
    if options.profiling {
        reserve += program.node_count();
    }
    buf.reserve_labels(reserve);

    let mut debug = if options.profiling {
        DebugMap::with_capacity(program.node_count())
    } else {
        DebugMap::new()
    };

    isa.prologue(&mut buf);
    emit_nodes(&program.nodes, isa, &mut buf, &mut debug, options.profiling);
    isa.epilogue(&mut buf);

    let code = buf.finish()?;
    debug.resolve_all(&code);
    log::debug!(
        "compiled {} nodes into {} bytes",
        program.node_count(),
        code.len()
    );
    Ok(CompiledProgram { code, debug })
}

fn emit_nodes(
    nodes: &[Node],
    isa: &mut dyn InstEmitter,
    buf: &mut CodeBuffer,
    debug: &mut DebugMap,
    profiling: bool,
) {
    for node in nodes {
        if profiling {
            let label = buf.get_label();
            buf.bind_label(label);
            debug.add_mapping(label, node);
        }
        match &node.kind {
            NodeKind::MovePtr { count } => isa.move_ptr(buf, *count),
            NodeKind::AddVal { count, offset } => isa.add_val(buf, *count, *offset),
            NodeKind::Output { offset } => isa.output(buf, *offset),
            NodeKind::Input { offset } => isa.input(buf, *offset),
            NodeKind::SetConst { value, offset } => isa.set_const(buf, *value, *offset),
            NodeKind::Mul {
                multiplier,
                src_offset,
                dst_offset,
            } => isa.mul(buf, *multiplier, *src_offset, *dst_offset),
            NodeKind::CopyCell {
                src_offset,
                dst_offset,
            } => isa.copy_cell(buf, *src_offset, *dst_offset),
            NodeKind::Loop { body } => {
                let start = buf.get_label();
                let end = buf.get_label();
                isa.branch_if_zero(buf, end);
                buf.bind_label(start);
                emit_nodes(body, isa, buf, debug, profiling);
                isa.branch_if_nonzero(buf, start);
                buf.bind_label(end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa;
    use bf_ir::parse;

    fn options() -> CompileOptions {
        CompileOptions {
            memory_size: 60 * 1024,
            memory_offset: 4096,
            bounds_checks: true,
            profiling: true,
            host: HostFuncs {
                putchar: 0x1122_3344_5566,
                getchar: 0x6655_4433_2211,
            },
        }
    }

    #[test]
    fn empty_program_is_prologue_and_epilogue_only() {
        let program = parse(b"").unwrap();
        let opts = options();
        let mut isa = isa::host_emitter(&opts).unwrap();
        let compiled = compile(&program, isa.as_mut(), &opts).unwrap();
        assert!(!compiled.code.is_empty());
        assert!(compiled.debug.is_empty());
    }

    #[test]
    fn every_node_gets_a_debug_entry_in_emission_order() {
        let program = parse(b"+[->+<].").unwrap();
        let opts = options();
        let mut isa = isa::host_emitter(&opts).unwrap();
        let compiled = compile(&program, isa.as_mut(), &opts).unwrap();
        assert_eq!(compiled.debug.len(), program.node_count());

        let offsets: Vec<u32> = compiled
            .debug
            .entries()
            .iter()
            .map(|e| e.pc_offset)
            .collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted, "entries must be in ascending PC order");
        // Code for the first node starts after the prologue.
        assert!(offsets[0] > 0);
    }

    #[test]
    fn nested_loops_resolve_their_labels() {
        let program = parse(b"[[[+]]]").unwrap();
        let opts = CompileOptions {
            profiling: false,
            ..options()
        };
        let mut isa = isa::host_emitter(&opts).unwrap();
        let compiled = compile(&program, isa.as_mut(), &opts).unwrap();
        assert!(!compiled.code.is_empty());
    }
}
