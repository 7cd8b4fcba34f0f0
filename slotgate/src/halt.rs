//! Administrative halt.

use std::io::Write;

/// Exit status of a halted gate, matching a fatal log exit.
pub const HALT_EXIT_CODE: i32 = 1;

/// Hook invoked by the `/HALT` route.
pub trait Halt: Send + Sync {
    /// Terminate the process. Production implementations never return.
    fn halt(&self);
}

/// Flushes stdout and stderr, then exits without draining in-flight requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitProcess;

impl Halt for ExitProcess {
    fn halt(&self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        std::process::exit(HALT_EXIT_CODE);
    }
}
