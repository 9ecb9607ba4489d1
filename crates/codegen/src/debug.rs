//! The debug map: PC offsets back to IR nodes.
//!
//! During emission every IR node gets a label bound at the start of its
//! code; the map records the label together with the node's location, tag
//! and sample counter. Once the buffer is finished the labels resolve to
//! byte offsets and `find_by_pc` can answer "which node does this PC
//! belong to" for the profiler.

use std::sync::atomic::AtomicU32;

use bf_ir::{Node, NodeTag, SourceLoc};

use crate::buffer::{FinishedCode, Label};

/// One node's slice of the emitted code.
pub struct DebugEntry {
    pub label: Label,
    /// Byte offset from the start of the code; 0 until resolved.
    pub pc_offset: u32,
    pub loc: SourceLoc,
    pub tag: NodeTag,
    samples: *const AtomicU32,
}

impl DebugEntry {
    /// The node's sample counter.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the IR tree this entry points into is
    /// still alive and has not moved since `add_mapping` recorded it.
    pub unsafe fn samples(&self) -> &AtomicU32 {
        unsafe { &*self.samples }
    }
}

/// Grow-only mapping from emitted code positions to IR nodes, in emission
/// order.
#[derive(Default)]
pub struct DebugMap {
    entries: Vec<DebugEntry>,
}

impl DebugMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    /// Record that `node`'s code starts at `label`.
    pub fn add_mapping(&mut self, label: Label, node: &Node) {
        self.entries.push(DebugEntry {
            label,
            pc_offset: 0,
            loc: node.loc,
            tag: node.kind.tag(),
            samples: node.samples() as *const AtomicU32,
        });
    }

    /// Fill in `pc_offset` for every entry from the finished code's label
    /// table.
    pub fn resolve_all(&mut self, code: &FinishedCode) {
        for entry in &mut self.entries {
            entry.pc_offset = code.label_offset(entry.label).unwrap_or(0);
        }
    }

    /// The entry covering `pc_offset`: the one with the largest resolved
    /// offset that is `<= pc_offset`. Linear scan; callers sample at
    /// profiling rates, not per instruction.
    pub fn find_by_pc(&self, pc_offset: u32) -> Option<&DebugEntry> {
        let mut best: Option<&DebugEntry> = None;
        for entry in &self.entries {
            if entry.pc_offset <= pc_offset
                && best.is_none_or(|b| entry.pc_offset >= b.pc_offset)
            {
                best = Some(entry);
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DebugEntry] {
        &self.entries
    }
}
