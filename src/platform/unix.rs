//! Unix process termination via SIGTERM

use super::{PlatformError, ProcessTerminator};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

pub struct SignalTerminator;

impl SignalTerminator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SignalTerminator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTerminator for SignalTerminator {
    fn terminate(&self, pid: u32) -> Result<(), PlatformError> {
        let raw = i32::try_from(pid).map_err(|_| PlatformError::TerminateError {
            pid,
            message: "pid out of range".to_string(),
        })?;

        kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| PlatformError::TerminateError {
            pid,
            message: e.to_string(),
        })
    }
}
