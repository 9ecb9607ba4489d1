//! The `bf` command-line interface library.

pub mod commands;
