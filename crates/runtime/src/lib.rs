//! Runtime support for the `bf` compiler: anonymous executable mappings,
//! the guard-paged tape, the console shims emitted code calls, and the
//! sampling profiler.
//!
//! Everything here is unix-only by design; the mapping and signal
//! machinery goes straight to `mmap`/`mprotect` and
//! `sigaction`/`setitimer`.

mod code;
mod io;
mod mmap;
mod profile;
mod tape;

pub use code::{CodeMemory, ExecutableCode};
pub use io::{bf_getchar, bf_putchar};
pub use profile::{Profiler, SAMPLE_RATE_HZ, SampleStats, write_folded};
pub use tape::Tape;
