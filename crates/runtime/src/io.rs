//! Console shims the emitted code calls by absolute address.

use std::io::{ErrorKind, Read, Write};

/// Write one byte to stdout, unbuffered so output is observable the
/// moment the compiled program produces it.
pub extern "C" fn bf_putchar(byte: u8) {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(&[byte]).and_then(|()| stdout.flush());
}

/// Read the next byte from stdin; -1 signals EOF (or an unreadable
/// stdin, which the compiled program cannot distinguish).
pub extern "C" fn bf_getchar() -> i32 {
    let mut byte = [0u8; 1];
    loop {
        match std::io::stdin().read(&mut byte) {
            Ok(0) => return -1,
            Ok(_) => return i32::from(byte[0]),
            // The profiler's timer signal is installed with SA_RESTART,
            // but a short read can still surface as an interruption.
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return -1,
        }
    }
}
