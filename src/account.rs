//! WARP account registration through the `wgcf` tool
//!
//! Both steps are create-if-absent: the account file gates `register`, the
//! profile file gates `generate`. The tool runs with the data directory as its
//! working directory and writes both files there itself.

use crate::paths::DataLayout;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Failed to launch `{command}`: {source}")]
    LaunchFailed {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

pub struct AccountRegistrar {
    executable: PathBuf,
    work_dir: PathBuf,
    account: PathBuf,
    profile: PathBuf,
}

impl AccountRegistrar {
    pub fn new(layout: &DataLayout) -> Self {
        Self {
            executable: layout.registration_exe().to_path_buf(),
            work_dir: layout.root().to_path_buf(),
            account: layout.account(),
            profile: layout.profile(),
        }
    }

    /// Register a new account unless one already exists
    pub async fn ensure_account(&self) -> Result<(), RegistrationError> {
        if self.account.exists() {
            debug!("Account present at {}", self.account.display());
            return Ok(());
        }

        info!("Registering with Cloudflare WARP...");
        self.run(&["register", "--accept-tos"]).await?;
        info!("WARP account registered");
        Ok(())
    }

    /// Derive the WireGuard profile from the account unless it already exists
    pub async fn ensure_profile(&self) -> Result<(), RegistrationError> {
        if self.profile.exists() {
            debug!("Profile present at {}", self.profile.display());
            return Ok(());
        }

        info!("Generating WireGuard profile...");
        self.run(&["generate"]).await?;
        info!("WireGuard profile generated");
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<(), RegistrationError> {
        let command = format!(
            "{} {}",
            self.executable
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            args.join(" ")
        );

        let mut cmd = Command::new(&self.executable);
        cmd.args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(crate::platform::windows::CREATE_NO_WINDOW);

        let output = cmd
            .output()
            .await
            .map_err(|source| RegistrationError::LaunchFailed {
                command: command.clone(),
                source,
            })?;

        debug!(
            "`{}` stdout: {}",
            command,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        if !output.status.success() {
            return Err(RegistrationError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}
