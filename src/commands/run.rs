//! The driver: parse, optimize, generate, map, allocate, execute.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;

use bf_codegen::{CompileOptions, HostFuncs, compile, isa};
use bf_runtime::{CodeMemory, Profiler, Tape, bf_getchar, bf_putchar, write_folded};

/// Ahead-of-execution JIT compiler for the eight-instruction tape
/// language: compiles a program to native code for the host CPU and runs
/// it against a guard-paged tape.
#[derive(Parser)]
#[command(name = "bf", version)]
pub struct RunCommand {
    /// The program file to compile and run
    #[arg(value_name = "PROGRAM-FILE")]
    program: PathBuf,

    /// Dump the optimized IR tree and a hex dump of the emitted code to
    /// stderr
    #[arg(long)]
    debug: bool,

    /// Skip the optimization passes and emit directly from the parsed IR
    #[arg(long = "no-optimize")]
    no_optimize: bool,

    /// Print the wall-clock duration of each phase to stderr
    #[arg(long)]
    timing: bool,

    /// Elide the inline bounds checks in the emitted code; the guard
    /// pages around the tape remain
    #[arg(long = "unsafe")]
    unsafe_mode: bool,

    /// Enable the sampling profiler and write folded stacks to this file
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// Tape size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 65_536)]
    memory: usize,

    /// Initial cursor offset into the tape; must be smaller than the tape
    /// size
    #[arg(long = "memory-offset", value_name = "BYTES", default_value_t = 4096)]
    memory_offset: usize,
}

impl RunCommand {
    pub fn execute(self) -> Result<()> {
        // Validate the memory configuration before anything is allocated.
        if self.memory_offset >= self.memory {
            bail!(
                "memory offset {} must be smaller than the tape size {}",
                self.memory_offset,
                self.memory
            );
        }
        // The emitters address the tape with signed 32-bit displacements.
        i32::try_from(self.memory)
            .context("tape size does not fit the code generator's address range")?;
        let memory_size = (self.memory - self.memory_offset) as u32;
        let memory_offset = self.memory_offset as u32;

        let mut timer = PhaseTimer::new(self.timing);

        let source = fs::read(&self.program)
            .with_context(|| format!("failed to read program `{}`", self.program.display()))?;
        let mut program = bf_ir::parse(&source)?;
        timer.lap("parse");

        if !self.no_optimize {
            bf_ir::optimize(&mut program);
            timer.lap("optimize");
        }

        let options = CompileOptions {
            memory_size,
            memory_offset,
            bounds_checks: !self.unsafe_mode,
            profiling: self.profile.is_some(),
            host: HostFuncs {
                putchar: bf_putchar as usize,
                getchar: bf_getchar as usize,
            },
        };
        let mut emitter = isa::host_emitter(&options)?;
        let compiled = compile(&program, emitter.as_mut(), &options)?;
        log::debug!("emitted {} bytes of code", compiled.code.len());
        timer.lap("generate");

        if self.debug {
            eprint!("{program}");
            hex_dump(compiled.code.bytes());
        }

        let code = CodeMemory::map(compiled.code.bytes())?.publish()?;
        timer.lap("map");

        let tape = Tape::allocate(self.memory, self.memory_offset)?;
        timer.lap("tape");

        // SAFETY: `compiled` (the debug map and the IR tree it points
        // into) stays alive and in place until after `stop` below.
        let mut profiler = match &self.profile {
            Some(_) => Some(unsafe {
                Profiler::start(&compiled.debug, code.code_start(), code.code_end())?
            }),
            None => None,
        };

        // SAFETY: the code was produced by the host emitter for exactly
        // this tape layout.
        let status = unsafe { code.invoke(tape.entry_ptr()) };
        timer.lap("execute");

        if let Some(mut profiler) = profiler.take() {
            let stats = profiler.stop();
            let path = self.profile.as_ref().expect("profiler implies a path");
            let mut file = fs::File::create(path)
                .with_context(|| format!("failed to create profile `{}`", path.display()))?;
            write_folded(&program, &stats, &mut file)
                .with_context(|| format!("failed to write profile `{}`", path.display()))?;
            timer.lap("profile");
        }

        if status != 0 {
            bail!("compiled program exited with status {status}");
        }
        Ok(())
    }
}

struct PhaseTimer {
    enabled: bool,
    last: Instant,
}

impl PhaseTimer {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last: Instant::now(),
        }
    }

    fn lap(&mut self, phase: &str) {
        if self.enabled {
            eprintln!("{phase}: {:.3?}", self.last.elapsed());
        }
        self.last = Instant::now();
    }
}

fn hex_dump(bytes: &[u8]) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        eprint!("{:08x}:", row * 16);
        for byte in chunk {
            eprint!(" {byte:02x}");
        }
        eprintln!();
    }
}
