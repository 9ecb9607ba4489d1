//! Loop-pattern lowering.
//!
//! A counting loop whose body only adds into fixed offsets while decrementing
//! the counter cell once per iteration multiplies each addend by the
//! counter's value. Such a loop is replaced by straight-line `Mul`/`CopyCell`
//! nodes and a final clear of the counter. The clear loop `[-]` is the
//! degenerate case with no addends.

use smallvec::SmallVec;

use crate::node::{Node, NodeKind, SourceLoc};

/// Lower `body` if it matches the counting-loop shape; every produced node
/// carries the loop's own source location.
///
/// The body must consist solely of `AddVal` nodes, exactly one of which is
/// the `AddVal(-1, 0)` counter decrement. Anything else, a `MovePtr`
/// included, leaves the loop intact: after offset threading a lowerable body
/// has no interior movement left, and a body that still moves the cursor
/// cannot be multiplied out.
pub(crate) fn lower_loop(body: &[Node], loop_loc: SourceLoc) -> Option<Vec<Node>> {
    let mut decrements = 0usize;
    let mut addends: SmallVec<[(i32, i32); 8]> = SmallVec::new();

    for node in body {
        match node.kind {
            NodeKind::AddVal { count, offset } => {
                if offset == 0 {
                    if count == -1 {
                        decrements += 1;
                    } else {
                        return None;
                    }
                } else {
                    addends.push((count, offset));
                }
            }
            _ => return None,
        }
    }
    if decrements != 1 {
        return None;
    }

    let mut lowered = Vec::with_capacity(addends.len() + 1);
    for (count, offset) in addends {
        let kind = if count == 1 {
            NodeKind::CopyCell {
                src_offset: 0,
                dst_offset: offset,
            }
        } else {
            NodeKind::Mul {
                multiplier: count,
                src_offset: 0,
                dst_offset: offset,
            }
        };
        lowered.push(Node::new(kind, loop_loc));
    }
    lowered.push(Node::new(NodeKind::SetConst { value: 0, offset: 0 }, loop_loc));
    Some(lowered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(count: i32, offset: i32) -> Node {
        Node::new(NodeKind::AddVal { count, offset }, SourceLoc::new(1, 2))
    }

    #[test]
    fn clear_loop_lowers_to_a_single_set() {
        let lowered = lower_loop(&[add(-1, 0)], SourceLoc::new(1, 1)).unwrap();
        assert_eq!(
            lowered,
            vec![Node::new(
                NodeKind::SetConst { value: 0, offset: 0 },
                SourceLoc::new(1, 1),
            )]
        );
    }

    #[test]
    fn addends_lower_in_body_order() {
        let lowered = lower_loop(
            &[add(2, 1), add(-1, 0), add(1, -2)],
            SourceLoc::new(3, 7),
        )
        .unwrap();
        assert_eq!(lowered.len(), 3);
        assert_eq!(
            lowered[0].kind,
            NodeKind::Mul {
                multiplier: 2,
                src_offset: 0,
                dst_offset: 1,
            }
        );
        assert_eq!(
            lowered[1].kind,
            NodeKind::CopyCell {
                src_offset: 0,
                dst_offset: -2,
            }
        );
        assert_eq!(lowered[2].kind, NodeKind::SetConst { value: 0, offset: 0 });
        assert!(lowered.iter().all(|n| n.loc == SourceLoc::new(3, 7)));
    }

    #[test]
    fn rejects_missing_or_repeated_decrement() {
        assert!(lower_loop(&[add(2, 1)], SourceLoc::new(1, 1)).is_none());
        assert!(lower_loop(&[add(-1, 0), add(-1, 0)], SourceLoc::new(1, 1)).is_none());
        assert!(lower_loop(&[add(-2, 0)], SourceLoc::new(1, 1)).is_none());
    }

    #[test]
    fn rejects_interior_movement_and_side_effects() {
        let moved = Node::new(NodeKind::MovePtr { count: 1 }, SourceLoc::new(1, 2));
        assert!(lower_loop(&[add(-1, 0), moved], SourceLoc::new(1, 1)).is_none());

        let output = Node::new(NodeKind::Output { offset: 0 }, SourceLoc::new(1, 2));
        assert!(lower_loop(&[add(-1, 0), output], SourceLoc::new(1, 1)).is_none());
    }
}
