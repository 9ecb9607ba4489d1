//! The peephole fixed point.
//!
//! Rules are applied bottom-up (loop bodies first) and restart just before
//! the rewrite site whenever one fires, so that a coalesced node is
//! immediately reconsidered against its new neighbors. The pass terminates
//! because every rule strictly shrinks the sibling list.

use super::loops;
use crate::node::{Node, NodeKind};

pub(crate) fn run_to_fixpoint(nodes: &mut Vec<Node>) {
    for node in nodes.iter_mut() {
        if let NodeKind::Loop { body } = &mut node.kind {
            run_to_fixpoint(body);
        }
    }

    let mut i = 0;
    while i < nodes.len() {
        if rewrite_at(nodes, i) {
            // A rewrite at `i` can expose a pair with `i - 1` or complete a
            // move/add/move triple starting at `i - 2`.
            i = i.saturating_sub(2);
        } else {
            i += 1;
        }
    }
}

/// Try every rule anchored at `i`; returns whether one fired.
fn rewrite_at(nodes: &mut Vec<Node>, i: usize) -> bool {
    if let NodeKind::Loop { body } = &nodes[i].kind {
        if let Some(lowered) = loops::lower_loop(body, nodes[i].loc) {
            nodes.splice(i..=i, lowered);
            return true;
        }
        return false;
    }

    if i + 1 < nodes.len() {
        match (&nodes[i].kind, &nodes[i + 1].kind) {
            // Run-length fold: adjacent cursor moves.
            (&NodeKind::MovePtr { count: a }, &NodeKind::MovePtr { count: b }) => {
                if a + b == 0 {
                    nodes.drain(i..=i + 1);
                } else {
                    nodes[i].kind = NodeKind::MovePtr { count: a + b };
                    nodes.remove(i + 1);
                }
                return true;
            }
            // Run-length fold: adjacent adds to the same cell.
            (
                &NodeKind::AddVal { count: a, offset },
                &NodeKind::AddVal {
                    count: b,
                    offset: other,
                },
            ) if offset == other => {
                if a + b == 0 {
                    nodes.drain(i..=i + 1);
                } else {
                    nodes[i].kind = NodeKind::AddVal { count: a + b, offset };
                    nodes.remove(i + 1);
                }
                return true;
            }
            // A store absorbs a following add to the same cell.
            (
                &NodeKind::SetConst { value, offset },
                &NodeKind::AddVal {
                    count,
                    offset: other,
                },
            ) if offset == other => {
                nodes[i].kind = NodeKind::SetConst {
                    value: value + count,
                    offset,
                };
                nodes.remove(i + 1);
                return true;
            }
            // An add right before a store to the same cell is dead.
            (
                &NodeKind::AddVal { offset, .. },
                &NodeKind::SetConst {
                    value,
                    offset: other,
                },
            ) if offset == other => {
                nodes[i].kind = NodeKind::SetConst { value, offset };
                nodes.remove(i + 1);
                return true;
            }
            _ => {}
        }
    }

    // Offset-add collapse: the moves must exactly cancel.
    if i + 2 < nodes.len() {
        if let (
            &NodeKind::MovePtr { count: n },
            &NodeKind::AddVal { count, offset: 0 },
            &NodeKind::MovePtr { count: back },
        ) = (&nodes[i].kind, &nodes[i + 1].kind, &nodes[i + 2].kind)
        {
            if n != 0 && back == -n {
                nodes[i].kind = NodeKind::AddVal { count, offset: n };
                nodes.drain(i + 1..=i + 2);
                return true;
            }
        }
    }

    false
}
