//! Source reader and parser.
//!
//! Only the eight operator characters are meaningful; every other byte is a
//! comment. Comments still advance line/column tracking so that node
//! locations and parse errors point at the real source position.

use thiserror::Error;

use crate::node::{Node, NodeKind, Program, SourceLoc};
use crate::MAX_NESTING;

/// A fatal problem with the source program.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unmatched `[` at line {line}, column {column}")]
    UnmatchedOpen { line: u32, column: u32 },
    #[error("unmatched `]` at line {line}, column {column}")]
    UnmatchedClose { line: u32, column: u32 },
    #[error("loop nesting exceeds {limit} levels at line {line}, column {column}")]
    TooDeep {
        line: u32,
        column: u32,
        limit: usize,
    },
}

/// An open loop whose `]` has not been seen yet.
struct OpenLoop {
    loc: SourceLoc,
    body: Vec<Node>,
}

/// Parse a byte stream into the root sibling list.
pub fn parse(src: &[u8]) -> Result<Program, ParseError> {
    let mut root: Vec<Node> = Vec::new();
    let mut open: Vec<OpenLoop> = Vec::new();
    let mut line: u32 = 1;
    let mut column: u32 = 1;

    for &byte in src {
        let loc = SourceLoc::new(line, column);
        if byte == b'\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }

        let kind = match byte {
            b'>' => NodeKind::MovePtr { count: 1 },
            b'<' => NodeKind::MovePtr { count: -1 },
            b'+' => NodeKind::AddVal { count: 1, offset: 0 },
            b'-' => NodeKind::AddVal { count: -1, offset: 0 },
            b'.' => NodeKind::Output { offset: 0 },
            b',' => NodeKind::Input { offset: 0 },
            b'[' => {
                if open.len() >= MAX_NESTING {
                    return Err(ParseError::TooDeep {
                        line: loc.line,
                        column: loc.column,
                        limit: MAX_NESTING,
                    });
                }
                open.push(OpenLoop {
                    loc,
                    body: Vec::new(),
                });
                continue;
            }
            b']' => {
                let Some(finished) = open.pop() else {
                    return Err(ParseError::UnmatchedClose {
                        line: loc.line,
                        column: loc.column,
                    });
                };
                let node = Node::new(NodeKind::Loop { body: finished.body }, finished.loc);
                match open.last_mut() {
                    Some(parent) => parent.body.push(node),
                    None => root.push(node),
                }
                continue;
            }
            _ => continue,
        };

        let node = Node::new(kind, loc);
        match open.last_mut() {
            Some(parent) => parent.body.push(node),
            None => root.push(node),
        }
    }

    if let Some(unclosed) = open.last() {
        return Err(ParseError::UnmatchedOpen {
            line: unclosed.loc.line,
            column: unclosed.loc.column,
        });
    }

    log::debug!("parsed {} top-level nodes", root.len());
    Ok(Program { nodes: root })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(s: &str) -> Result<Program, ParseError> {
        parse(s.as_bytes())
    }

    #[test]
    fn empty_input_parses_to_empty_program() {
        assert_eq!(parse_str("").unwrap().nodes, vec![]);
    }

    #[test]
    fn comment_only_input_parses_to_empty_program() {
        assert_eq!(parse_str("hello world\nsecond line\n").unwrap().nodes, vec![]);
    }

    #[test]
    fn operators_carry_their_source_position() {
        let program = parse_str("+x\n >").unwrap();
        assert_eq!(
            program.nodes,
            vec![
                Node::new(NodeKind::AddVal { count: 1, offset: 0 }, SourceLoc::new(1, 1)),
                Node::new(NodeKind::MovePtr { count: 1 }, SourceLoc::new(2, 2)),
            ]
        );
    }

    #[test]
    fn loop_nodes_carry_the_open_bracket_position() {
        let program = parse_str("+[-]").unwrap();
        assert_eq!(program.nodes.len(), 2);
        let node = &program.nodes[1];
        assert_eq!(node.loc, SourceLoc::new(1, 2));
        match &node.kind {
            NodeKind::Loop { body } => {
                assert_eq!(
                    body,
                    &vec![Node::new(
                        NodeKind::AddVal { count: -1, offset: 0 },
                        SourceLoc::new(1, 3)
                    )]
                );
            }
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_close_reports_its_position() {
        assert_eq!(
            parse_str("+\n]").unwrap_err(),
            ParseError::UnmatchedClose { line: 2, column: 1 }
        );
    }

    #[test]
    fn unmatched_open_reports_the_unclosed_bracket() {
        assert_eq!(
            parse_str("[[+]").unwrap_err(),
            ParseError::UnmatchedOpen { line: 1, column: 1 }
        );
    }

    #[test]
    fn all_eight_operators_lex() {
        let program = parse_str("><+-.,[]").unwrap();
        assert_eq!(
            program.nodes,
            vec![
                Node::new(NodeKind::MovePtr { count: 1 }, SourceLoc::new(1, 1)),
                Node::new(NodeKind::MovePtr { count: -1 }, SourceLoc::new(1, 2)),
                Node::new(NodeKind::AddVal { count: 1, offset: 0 }, SourceLoc::new(1, 3)),
                Node::new(NodeKind::AddVal { count: -1, offset: 0 }, SourceLoc::new(1, 4)),
                Node::new(NodeKind::Output { offset: 0 }, SourceLoc::new(1, 5)),
                Node::new(NodeKind::Input { offset: 0 }, SourceLoc::new(1, 6)),
                Node::new(NodeKind::Loop { body: vec![] }, SourceLoc::new(1, 7)),
            ]
        );
    }

    #[test]
    fn carriage_returns_are_comments_that_advance_the_column() {
        // Only `\n` resets the column; `\r` is an ordinary comment byte.
        let program = parse_str("\r\n+").unwrap();
        assert_eq!(program.nodes[0].loc, SourceLoc::new(2, 1));
        let program = parse_str("+\r+").unwrap();
        assert_eq!(program.nodes[1].loc, SourceLoc::new(1, 3));
    }

    #[test]
    fn non_utf8_bytes_are_comments() {
        let program = parse(b"\xff\xfe+\x80").unwrap();
        assert_eq!(
            program.nodes,
            vec![Node::new(
                NodeKind::AddVal { count: 1, offset: 0 },
                SourceLoc::new(1, 3)
            )]
        );
    }

    #[test]
    fn nesting_up_to_the_limit_parses() {
        let mut src = String::new();
        for _ in 0..MAX_NESTING {
            src.push('[');
        }
        for _ in 0..MAX_NESTING {
            src.push(']');
        }
        assert!(parse_str(&src).is_ok());
    }

    #[test]
    fn nesting_beyond_the_limit_is_fatal() {
        let mut src = String::new();
        for _ in 0..=MAX_NESTING {
            src.push('[');
        }
        for _ in 0..=MAX_NESTING {
            src.push(']');
        }
        assert_eq!(
            parse_str(&src).unwrap_err(),
            ParseError::TooDeep {
                line: 1,
                column: (MAX_NESTING + 1) as u32,
                limit: MAX_NESTING,
            }
        );
    }
}
