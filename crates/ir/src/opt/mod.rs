//! The optimizer: a fixed-point local rewriter over sibling lists.
//!
//! Two passes run in order. Offset threading first decouples data movement
//! from cursor movement so that every data operation addresses the tape by
//! an explicit offset; the peephole fixed point then coalesces and lowers
//! patterns until nothing more fires. Rewritten nodes always adopt the
//! source location of the first node their pattern consumed.

mod loops;
mod offsets;
mod peephole;

use crate::node::Program;

/// Run the full optimization pipeline in place.
pub fn optimize(program: &mut Program) {
    offsets::thread_offsets(&mut program.nodes);
    peephole::run_to_fixpoint(&mut program.nodes);
    log::debug!("optimized program has {} nodes", program.node_count());
}
