//! Platform-specific implementations

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to terminate process {pid}: {message}")]
    TerminateError { pid: u32, message: String },
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Operating system family, as far as release asset naming is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Windows,
    MacOs,
    /// Everything that is neither Windows nor macOS
    Linux,
}

impl Os {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Os::Windows
        } else if cfg!(target_os = "macos") {
            Os::MacOs
        } else {
            Os::Linux
        }
    }
}

/// The (platform, architecture) pair a release asset must be built for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub os: Os,
    /// Architecture name as reported by `std::env::consts::ARCH`
    pub arch: String,
}

impl Target {
    pub fn new(os: Os, arch: impl Into<String>) -> Self {
        Self {
            os,
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(Os::current(), std::env::consts::ARCH)
    }

    pub fn platform_token(&self) -> &'static str {
        match self.os {
            Os::Windows => "windows",
            Os::MacOs => "darwin",
            Os::Linux => "linux",
        }
    }

    /// Architecture token used in release asset names
    ///
    /// macOS builds only ship as `arm64` or `amd64`. Elsewhere x86-64 becomes
    /// `amd64` and any other architecture keeps its canonical name, where the
    /// canonical name of aarch64 is `arm64`.
    pub fn arch_token(&self) -> String {
        match (self.os, self.arch.as_str()) {
            (_, "x86_64") => "amd64".to_string(),
            (Os::MacOs, "aarch64") => "arm64".to_string(),
            (Os::MacOs, _) => "amd64".to_string(),
            (_, "aarch64") => "arm64".to_string(),
            (_, other) => other.to_string(),
        }
    }

    pub fn exe_suffix(&self) -> &'static str {
        match self.os {
            Os::Windows => ".exe",
            _ => "",
        }
    }
}

/// Platform-agnostic process termination
pub trait ProcessTerminator: Send + Sync {
    /// Ask the process (and on Windows its children) to go away
    fn terminate(&self, pid: u32) -> Result<(), PlatformError>;
}

/// Get the appropriate terminator for the current platform
pub fn get_terminator() -> Result<Box<dyn ProcessTerminator>, PlatformError> {
    #[cfg(unix)]
    {
        Ok(Box::new(unix::SignalTerminator::new()))
    }

    #[cfg(windows)]
    {
        Ok(Box::new(windows::TaskkillTerminator::new()))
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}
