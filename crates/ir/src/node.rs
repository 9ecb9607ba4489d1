//! The IR tree: tagged nodes, source locations, and sample counters.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// A 1-based source position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}:{}", self.line, self.column)
    }
}

/// One operation of the IR.
///
/// All offsets are relative to the cursor *at the point of execution of the
/// node*; after offset threading this may differ from the parse-time cursor
/// position. Cell arithmetic is wrapping byte arithmetic throughout.
#[derive(Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Advance the cursor by `count` cells (may be negative).
    MovePtr { count: i32 },
    /// Add `count` (mod 256) to the cell at `cursor + offset`.
    AddVal { count: i32, offset: i32 },
    /// Write the byte at `cursor + offset` to the console.
    Output { offset: i32 },
    /// Read one byte from the console into `cursor + offset`; on EOF the
    /// cell is left unchanged.
    Input { offset: i32 },
    /// Run `body` repeatedly while the byte at `cursor` is nonzero.
    Loop { body: Vec<Node> },
    /// Store `value` (mod 256) into the cell at `cursor + offset`.
    SetConst { value: i32, offset: i32 },
    /// `tape[cursor + dst_offset] += multiplier * tape[cursor + src_offset]`.
    Mul {
        multiplier: i32,
        src_offset: i32,
        dst_offset: i32,
    },
    /// `tape[cursor + dst_offset] += tape[cursor + src_offset]`.
    ///
    /// Semantically `Mul` with a multiplier of 1; kept as its own case so
    /// the back ends can emit the shorter add-without-multiply form.
    CopyCell { src_offset: i32, dst_offset: i32 },
}

/// Names for the node cases as they appear in debug dumps and folded
/// profiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeTag {
    MovePtr,
    AddVal,
    Output,
    Input,
    Loop,
    SetConst,
    Mul,
    CopyCell,
}

impl NodeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeTag::MovePtr => "MOVE_PTR",
            NodeTag::AddVal => "ADD_VAL",
            NodeTag::Output => "OUTPUT",
            NodeTag::Input => "INPUT",
            NodeTag::Loop => "LOOP",
            NodeTag::SetConst => "SET_CONST",
            NodeTag::Mul => "MUL",
            NodeTag::CopyCell => "COPY_CELL",
        }
    }
}

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NodeKind {
    pub fn tag(&self) -> NodeTag {
        match self {
            NodeKind::MovePtr { .. } => NodeTag::MovePtr,
            NodeKind::AddVal { .. } => NodeTag::AddVal,
            NodeKind::Output { .. } => NodeTag::Output,
            NodeKind::Input { .. } => NodeTag::Input,
            NodeKind::Loop { .. } => NodeTag::Loop,
            NodeKind::SetConst { .. } => NodeTag::SetConst,
            NodeKind::Mul { .. } => NodeTag::Mul,
            NodeKind::CopyCell { .. } => NodeTag::CopyCell,
        }
    }
}

/// A node of the IR tree: an operation, where it came from in the source,
/// and how many profiler samples landed on its emitted code.
#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub loc: SourceLoc,
    samples: AtomicU32,
}

impl Node {
    pub fn new(kind: NodeKind, loc: SourceLoc) -> Self {
        Self {
            kind,
            loc,
            samples: AtomicU32::new(0),
        }
    }

    /// The profiler's sample counter for this node.
    ///
    /// Incremented from the sampling signal handler while emitted code runs;
    /// read only after the profiler has been stopped.
    pub fn samples(&self) -> &AtomicU32 {
        &self.samples
    }

    pub fn sample_count(&self) -> u32 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// Sample counters are profiling state, not program identity.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.loc == other.loc
    }
}

impl Eq for Node {}

/// The root sibling list of a parsed program.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Program {
    pub nodes: Vec<Node>,
}

impl Program {
    /// Total node count, loops' bodies included. Used to size the debug
    /// label pool when profiling is enabled.
    pub fn node_count(&self) -> usize {
        fn count(nodes: &[Node]) -> usize {
            nodes
                .iter()
                .map(|n| match &n.kind {
                    NodeKind::Loop { body } => 1 + count(body),
                    _ => 1,
                })
                .sum()
        }
        count(&self.nodes)
    }
}

fn fmt_node(node: &Node, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    match &node.kind {
        NodeKind::MovePtr { count } => writeln!(f, "MOVE_PTR count={count} {}", node.loc),
        NodeKind::AddVal { count, offset } => {
            writeln!(f, "ADD_VAL count={count} offset={offset} {}", node.loc)
        }
        NodeKind::Output { offset } => writeln!(f, "OUTPUT offset={offset} {}", node.loc),
        NodeKind::Input { offset } => writeln!(f, "INPUT offset={offset} {}", node.loc),
        NodeKind::SetConst { value, offset } => {
            writeln!(f, "SET_CONST value={value} offset={offset} {}", node.loc)
        }
        NodeKind::Mul {
            multiplier,
            src_offset,
            dst_offset,
        } => writeln!(
            f,
            "MUL multiplier={multiplier} src={src_offset} dst={dst_offset} {}",
            node.loc
        ),
        NodeKind::CopyCell {
            src_offset,
            dst_offset,
        } => writeln!(f, "COPY_CELL src={src_offset} dst={dst_offset} {}", node.loc),
        NodeKind::Loop { body } => {
            writeln!(f, "LOOP {}", node.loc)?;
            for child in body {
                fmt_node(child, indent + 1, f)?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            fmt_node(node, 0, f)?;
        }
        Ok(())
    }
}
