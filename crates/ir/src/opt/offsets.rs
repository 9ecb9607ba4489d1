//! Offset threading.
//!
//! Within each maximal loop-free run of siblings, successive `MovePtr`
//! nodes are folded into a running logical offset, every data operation is
//! rebased by that offset, and a single residual `MovePtr` is appended only
//! when the run's net movement is nonzero. Loop bodies are rewritten
//! recursively. After this pass the only cursor movement left is the one
//! the program actually needs at run time.

use crate::node::{Node, NodeKind, SourceLoc};

pub(crate) fn thread_offsets(nodes: &mut Vec<Node>) {
    let old = std::mem::take(nodes);
    let mut out: Vec<Node> = Vec::with_capacity(old.len());

    // Running offset of the current block and the location of the first
    // `MovePtr` consumed into it, which the residual move inherits.
    let mut run: i32 = 0;
    let mut first_move: Option<SourceLoc> = None;

    for mut node in old {
        match &mut node.kind {
            NodeKind::MovePtr { count } => {
                if first_move.is_none() {
                    first_move = Some(node.loc);
                }
                run += *count;
            }
            NodeKind::Loop { body } => {
                // A loop ends the block: the cursor must physically be where
                // the program put it before the head test runs.
                if run != 0 {
                    let loc = first_move.expect("nonzero run implies a consumed move");
                    out.push(Node::new(NodeKind::MovePtr { count: run }, loc));
                }
                run = 0;
                first_move = None;
                thread_offsets(body);
                out.push(node);
            }
            other => {
                rebase(other, run);
                out.push(node);
            }
        }
    }

    if run != 0 {
        let loc = first_move.expect("nonzero run implies a consumed move");
        out.push(Node::new(NodeKind::MovePtr { count: run }, loc));
    }

    *nodes = out;
}

/// Shift every tape-addressing offset of `kind` by `base`.
fn rebase(kind: &mut NodeKind, base: i32) {
    match kind {
        NodeKind::AddVal { offset, .. }
        | NodeKind::Output { offset }
        | NodeKind::Input { offset }
        | NodeKind::SetConst { offset, .. } => *offset += base,
        NodeKind::Mul {
            src_offset,
            dst_offset,
            ..
        }
        | NodeKind::CopyCell {
            src_offset,
            dst_offset,
        } => {
            *src_offset += base;
            *dst_offset += base;
        }
        NodeKind::MovePtr { .. } | NodeKind::Loop { .. } => {
            unreachable!("moves and loops are handled by the block walk")
        }
    }
}
