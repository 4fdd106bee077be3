//! Windows process termination via taskkill

use super::{PlatformError, ProcessTerminator};
use std::os::windows::process::CommandExt;
use std::process::Command;

/// Suppresses the console window taskkill would otherwise flash
pub(crate) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub struct TaskkillTerminator;

impl TaskkillTerminator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TaskkillTerminator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTerminator for TaskkillTerminator {
    /// Forcefully terminates the whole process tree
    fn terminate(&self, pid: u32) -> Result<(), PlatformError> {
        let output = Command::new("taskkill")
            .args(["/pid", &pid.to_string(), "/f", "/t"])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| PlatformError::TerminateError {
                pid,
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlatformError::TerminateError {
                pid,
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}
