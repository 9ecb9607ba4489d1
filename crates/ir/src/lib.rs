//! Intermediate representation for the `bf` compiler.
//!
//! This crate owns the front half of the pipeline: reading a source program
//! into a tree of [`Node`]s annotated with source locations, and rewriting
//! that tree with the optimizer before code generation. The representation
//! is deliberately small; every data-carrying operation addresses the tape
//! relative to the cursor through a signed offset, which is what lets the
//! optimizer decouple data movement from cursor movement.

pub mod node;
pub mod opt;
pub mod parse;

pub use node::{Node, NodeKind, NodeTag, Program, SourceLoc};
pub use opt::optimize;
pub use parse::{ParseError, parse};

/// Maximum loop nesting depth accepted by the parser.
///
/// The code generator sizes its loop-label pool from this constant, so the
/// parser enforces it up front rather than letting emission fail later.
pub const MAX_NESTING: usize = 1000;
