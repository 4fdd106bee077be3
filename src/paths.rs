//! Fixed file layout inside the proxy data directory

use crate::config::{Config, ToolSpec};
use std::io;
use std::path::{Path, PathBuf};

const ACCOUNT_FILE: &str = "wgcf-account.toml";
const PROFILE_FILE: &str = "wgcf-profile.conf";
const PROXY_CONFIG_FILE: &str = "wireproxy.conf";

/// Canonical paths of every artifact the proxy pipeline produces
///
/// All artifacts are flat files directly under `root`. They are created once
/// and never overwritten, so an existence check is the only gate.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
    registration_exe: PathBuf,
    proxy_exe: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>, registration: &ToolSpec, proxy: &ToolSpec) -> Self {
        let root = root.into();
        Self {
            registration_exe: root.join(registration.executable_name()),
            proxy_exe: root.join(proxy.executable_name()),
            root,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.resolved_data_dir(),
            &config.tools.registration,
            &config.tools.proxy,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registration_exe(&self) -> &Path {
        &self.registration_exe
    }

    pub fn proxy_exe(&self) -> &Path {
        &self.proxy_exe
    }

    pub fn account(&self) -> PathBuf {
        self.root.join(ACCOUNT_FILE)
    }

    pub fn profile(&self) -> PathBuf {
        self.root.join(PROFILE_FILE)
    }

    pub fn proxy_config(&self) -> PathBuf {
        self.root.join(PROXY_CONFIG_FILE)
    }

    /// Scratch directory used while unpacking a tool's release archive
    pub fn extract_dir(&self, tool: &ToolSpec) -> PathBuf {
        self.root.join(format!("{}_extract", tool.name))
    }

    pub fn ensure_root(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}
