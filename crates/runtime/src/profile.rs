//! The wall-clock sampling profiler.
//!
//! A `setitimer(ITIMER_REAL)` timer delivers `SIGALRM` at the sampling
//! rate while the compiled program runs. The handler reads the
//! interrupted program counter out of the machine context; PCs inside the
//! emitted code are recorded into a bounded, pre-allocated sample buffer
//! and attributed to an IR node through the debug map. The handler
//! allocates nothing and does bounded work: one linear scan of the debug
//! map per sample, at most.
//!
//! The handler finds its state through a process-global pointer published
//! with release ordering on start and cleared on stop, after the timer
//! has been disarmed. Node sample counters are atomics; the only reader
//! runs after `stop`, the only writer is the handler.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::io::{self, Write};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Result, bail};
use bf_codegen::DebugMap;
use bf_ir::{Node, NodeKind, Program};

/// Timer frequency while profiling.
pub const SAMPLE_RATE_HZ: u32 = 1000;

/// Capacity of the raw sample buffer; samples past this are counted but
/// not stored.
const SAMPLE_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Copy, Default)]
struct Sample {
    pc: usize,
    elapsed_us: u64,
}

/// Pre-allocated append-only sample storage, written exclusively from the
/// signal handler and read only after the profiler has stopped.
struct SampleRing {
    samples: UnsafeCell<Box<[Sample]>>,
    len: AtomicUsize,
    dropped: AtomicUsize,
}

// One writer (the signal handler, which preempts rather than races the
// owning thread) and readers that only run after `stop`.
unsafe impl Sync for SampleRing {}

impl SampleRing {
    fn new() -> Self {
        Self {
            samples: UnsafeCell::new(vec![Sample::default(); SAMPLE_CAPACITY].into_boxed_slice()),
            len: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    fn push(&self, sample: Sample) {
        let len = self.len.load(Ordering::Relaxed);
        if len < SAMPLE_CAPACITY {
            unsafe {
                (*self.samples.get())[len] = sample;
            }
            self.len.store(len + 1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The recorded prefix. Only meaningful once the timer is disarmed.
    fn recorded(&self) -> &[Sample] {
        let len = self.len.load(Ordering::Relaxed);
        unsafe { &(&*self.samples.get())[..len] }
    }
}

struct SharedState {
    code_start: usize,
    code_end: usize,
    debug: *const DebugMap,
    epoch: Instant,
    ring: SampleRing,
}

/// The state the signal handler works against. Null when no profiler is
/// armed.
static ACTIVE: AtomicPtr<SharedState> = AtomicPtr::new(ptr::null_mut());

/// Counts reported after a profiling run.
#[derive(Clone, Copy, Debug)]
pub struct SampleStats {
    pub recorded: usize,
    pub dropped: usize,
}

/// A running sampling session. Stopping (explicitly or on drop) disarms
/// the timer before the handler's shared state is torn down.
pub struct Profiler {
    shared: Box<SharedState>,
    stopped: bool,
}

impl Profiler {
    /// Arm the timer and start attributing samples.
    ///
    /// # Safety
    ///
    /// `debug` (and the IR tree its entries point into) must stay alive
    /// and unmoved until [`Profiler::stop`] has returned.
    pub unsafe fn start(debug: &DebugMap, code_start: usize, code_end: usize) -> Result<Self> {
        let shared = Box::new(SharedState {
            code_start,
            code_end,
            debug: debug as *const DebugMap,
            epoch: Instant::now(),
            ring: SampleRing::new(),
        });
        let shared_ptr = ptr::from_ref(&*shared).cast_mut();
        if ACTIVE
            .compare_exchange(
                ptr::null_mut(),
                shared_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            bail!("a profiler is already active in this process");
        }

        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = on_timer as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGALRM, &action, ptr::null_mut()) != 0 {
                ACTIVE.store(ptr::null_mut(), Ordering::Release);
                bail!("sigaction failed: {}", io::Error::last_os_error());
            }

            let period = libc::timeval {
                tv_sec: 0,
                tv_usec: (1_000_000 / SAMPLE_RATE_HZ) as libc::suseconds_t,
            };
            let timer = libc::itimerval {
                it_interval: period,
                it_value: period,
            };
            if libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) != 0 {
                let err = io::Error::last_os_error();
                restore_default_handler();
                ACTIVE.store(ptr::null_mut(), Ordering::Release);
                bail!("setitimer failed: {err}");
            }
        }

        log::debug!(
            "profiler armed at {SAMPLE_RATE_HZ} Hz over {code_start:#x}..{code_end:#x}"
        );
        Ok(Self {
            shared,
            stopped: false,
        })
    }

    /// Disarm the timer, restore the default signal disposition, and
    /// unpublish the handler state -- in that order.
    pub fn stop(&mut self) -> SampleStats {
        if !self.stopped {
            unsafe {
                let zero = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                };
                let disarm = libc::itimerval {
                    it_interval: zero,
                    it_value: zero,
                };
                libc::setitimer(libc::ITIMER_REAL, &disarm, ptr::null_mut());
                restore_default_handler();
            }
            ACTIVE.store(ptr::null_mut(), Ordering::Release);
            self.stopped = true;
            let stats = self.stats();
            log::debug!(
                "profiler stopped: {} samples recorded, {} dropped",
                stats.recorded,
                stats.dropped
            );
            if log::log_enabled!(log::Level::Trace) {
                for sample in self.shared.ring.recorded() {
                    log::trace!("sample pc={:#x} t={}us", sample.pc, sample.elapsed_us);
                }
            }
        }
        self.stats()
    }

    fn stats(&self) -> SampleStats {
        SampleStats {
            recorded: self.shared.ring.len.load(Ordering::Relaxed),
            dropped: self.shared.ring.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Restore the default `SIGALRM` disposition. Goes through `SIG_IGN`
/// first so an expiry that raced the disarm is discarded instead of
/// killing the process once `SIG_DFL` is back.
unsafe fn restore_default_handler() {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGALRM, &action, ptr::null_mut());
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGALRM, &action, ptr::null_mut());
    }
}

unsafe extern "C" fn on_timer(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    let shared = ACTIVE.load(Ordering::Acquire);
    if shared.is_null() {
        return;
    }
    // SAFETY: the pointer was published by `start` and is only cleared
    // after the timer can no longer fire.
    let shared = unsafe { &*shared };

    let pc = unsafe { context_pc(context) };
    if pc < shared.code_start || pc >= shared.code_end {
        return;
    }

    let elapsed_us = u64::try_from(shared.epoch.elapsed().as_micros()).unwrap_or(u64::MAX);
    shared.ring.push(Sample { pc, elapsed_us });

    let rel = (pc - shared.code_start) as u32;
    // SAFETY: `start` requires the debug map (and the IR nodes behind its
    // sample pointers) to outlive the profiling session.
    if let Some(entry) = unsafe { (*shared.debug).find_by_pc(rel) } {
        unsafe { entry.samples() }.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pull the interrupted program counter out of the platform's machine
/// context.
cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        unsafe fn context_pc(context: *mut c_void) -> usize {
            let context = context.cast::<libc::ucontext_t>();
            unsafe { (*context).uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        unsafe fn context_pc(context: *mut c_void) -> usize {
            let context = context.cast::<libc::ucontext_t>();
            unsafe { (*context).uc_mcontext.pc as usize }
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
        unsafe fn context_pc(context: *mut c_void) -> usize {
            let context = context.cast::<libc::ucontext_t>();
            unsafe { (*(*context).uc_mcontext).__ss.__rip as usize }
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
        unsafe fn context_pc(context: *mut c_void) -> usize {
            let context = context.cast::<libc::ucontext_t>();
            unsafe { (*(*context).uc_mcontext).__ss.__pc as usize }
        }
    } else {
        unsafe fn context_pc(_context: *mut c_void) -> usize {
            0
        }
    }
}

/// Write the folded-stack profile: one line per sampled non-loop node,
/// prefixed by its enclosing loops in source order.
pub fn write_folded(
    program: &Program,
    stats: &SampleStats,
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(
        out,
        "# bf profile: {} samples recorded, {} dropped",
        stats.recorded, stats.dropped
    )?;
    let mut stack: Vec<String> = Vec::new();
    write_nodes(&program.nodes, &mut stack, out)
}

fn write_nodes(nodes: &[Node], stack: &mut Vec<String>, out: &mut dyn Write) -> io::Result<()> {
    for node in nodes {
        match &node.kind {
            NodeKind::Loop { body } => {
                // Loops emit no line of their own; they only frame their
                // descendants.
                stack.push(format!("{} LOOP", node.loc));
                write_nodes(body, stack, out)?;
                stack.pop();
            }
            _ => {
                let count = node.sample_count();
                if count > 0 {
                    for frame in stack.iter() {
                        write!(out, "{frame};")?;
                    }
                    writeln!(out, "{} {} {count}", node.loc, node.kind.tag())?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_ir::{NodeKind, SourceLoc, parse};
    use std::sync::atomic::Ordering;

    #[test]
    fn folded_lines_carry_the_loop_stack() {
        let program = parse(b"+[[.]-]").unwrap();
        // program: AddVal, Loop { Loop { Output }, AddVal }
        fn node_at<'a>(nodes: &'a [Node], path: &[usize]) -> &'a Node {
            let node = &nodes[path[0]];
            if path.len() == 1 {
                return node;
            }
            match &node.kind {
                NodeKind::Loop { body } => node_at(body, &path[1..]),
                _ => panic!("path descends into a non-loop"),
            }
        }
        node_at(&program.nodes, &[0]).samples().store(2, Ordering::Relaxed);
        node_at(&program.nodes, &[1, 0, 0])
            .samples()
            .store(7, Ordering::Relaxed);
        node_at(&program.nodes, &[1, 1]).samples().store(1, Ordering::Relaxed);

        let stats = SampleStats {
            recorded: 10,
            dropped: 0,
        };
        let mut out = Vec::new();
        write_folded(&program, &stats, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# bf profile: 10 samples recorded, 0 dropped");
        assert_eq!(lines[1], "@1:1 ADD_VAL 2");
        assert_eq!(lines[2], "@1:2 LOOP;@1:3 LOOP;@1:4 OUTPUT 7");
        assert_eq!(lines[3], "@1:2 LOOP;@1:6 ADD_VAL 1");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn unsampled_nodes_emit_nothing() {
        let program = parse(b"+-><").unwrap();
        let stats = SampleStats {
            recorded: 0,
            dropped: 0,
        };
        let mut out = Vec::new();
        write_folded(&program, &stats, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1, "only the header comment");
    }

    #[test]
    fn header_reports_drops() {
        let program = parse(b"").unwrap();
        let stats = SampleStats {
            recorded: 65_536,
            dropped: 12,
        };
        let mut out = Vec::new();
        write_folded(&program, &stats, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "# bf profile: 65536 samples recorded, 12 dropped\n"
        );
    }

    #[test]
    fn sibling_loops_do_not_share_frames() {
        let program = parse(b"[.][.]").unwrap();
        let NodeKind::Loop { body } = &program.nodes[1].kind else {
            panic!("expected loop");
        };
        body[0].samples().store(3, Ordering::Relaxed);

        let stats = SampleStats {
            recorded: 3,
            dropped: 0,
        };
        let mut out = Vec::new();
        write_folded(&program, &stats, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("@1:4 LOOP;@1:5 OUTPUT 3"), "got: {text}");
        assert!(!text.contains("@1:1 LOOP;@1:4"), "got: {text}");
    }

    #[test]
    fn start_and_stop_round_trip() {
        let map = DebugMap::new();
        let mut profiler = unsafe { Profiler::start(&map, 0x1000, 0x1000) }.unwrap();
        // A second session must be rejected while the first is armed.
        assert!(unsafe { Profiler::start(&map, 0x1000, 0x1000) }.is_err());
        let stats = profiler.stop();
        assert_eq!(stats.recorded, 0);

        // After stop the slot is free again.
        let mut profiler = unsafe { Profiler::start(&map, 0x1000, 0x1000) }.unwrap();
        profiler.stop();
    }

    #[test]
    fn loc_formatting_matches_the_frame_shape() {
        assert_eq!(SourceLoc::new(12, 34).to_string(), "@12:34");
    }
}
