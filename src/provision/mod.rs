//! External tool provisioning
//!
//! Makes sure a tool's executable exists in the data directory, fetching it
//! from the tool's latest release when it does not:
//!
//! 1. Fetch the release manifest
//! 2. Pick the asset built for this platform/architecture
//! 3. Download it (unpacking `.zip` / `.tar.gz` archives)
//! 4. Mark it executable and move it into place
//!
//! The executable only appears at its canonical path once it is complete.
//! Nothing here locks: two concurrent `ensure` calls for the same tool race,
//! so callers must serialize them.

pub mod archive;
pub mod asset;
pub mod client;

#[cfg(test)]
pub(crate) mod testing;

pub use archive::{ArchiveKind, SearchLimits};
pub use asset::{resolve_asset, ReleaseAsset, ReleaseManifest};
pub use client::{HttpReleaseClient, ReleaseClient};

use crate::config::ToolSpec;
use crate::paths::DataLayout;
use crate::platform::Target;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to fetch {url}: {message}")]
    NetworkFetch { url: String, message: String },
    #[error("Invalid release manifest from {url}: {message}")]
    InvalidManifest { url: String, message: String },
    #[error("Could not find {tool} binary for {platform}/{arch}")]
    AssetNotFound {
        tool: String,
        platform: String,
        arch: String,
    },
    #[error("Archive extraction failed: {0}")]
    ArchiveExtraction(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Downloads and installs external tools into a [`DataLayout`]
pub struct BinaryProvisioner<C> {
    client: C,
    layout: DataLayout,
    target: Target,
    limits: SearchLimits,
}

impl<C: ReleaseClient> BinaryProvisioner<C> {
    pub fn new(client: C, layout: DataLayout) -> Self {
        Self {
            client,
            layout,
            target: Target::current(),
            limits: SearchLimits::default(),
        }
    }

    /// Resolve assets for another platform (used by tests)
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn executable_path(&self, tool: &ToolSpec) -> PathBuf {
        self.layout.root().join(tool.executable_name())
    }

    /// Ensure `tool` is installed, returning its canonical path
    pub async fn ensure(&self, tool: &ToolSpec) -> Result<PathBuf, ProvisionError> {
        let dest = self.executable_path(tool);
        if dest.exists() {
            debug!("{} already present at {}", tool.name, dest.display());
            return Ok(dest);
        }

        info!("Downloading {}...", tool.name);

        let manifest = self.client.fetch_manifest(&tool.releases_url).await?;
        let asset = resolve_asset(&manifest.assets, &tool.name, &self.target).ok_or_else(|| {
            ProvisionError::AssetNotFound {
                tool: tool.name.clone(),
                platform: self.target.platform_token().to_string(),
                arch: self.target.arch_token(),
            }
        })?;
        info!("Selected release asset {}", asset.name);

        let staged = staging_path(&dest);
        let installed = match self.stage(tool, asset, &staged).await {
            Ok(()) => install(&staged, &dest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = installed {
            remove_file_quietly(&staged).await;
            return Err(e);
        }

        info!("{} installed at {}", tool.name, dest.display());
        Ok(dest)
    }

    /// Put the finished executable at `staged`
    async fn stage(
        &self,
        tool: &ToolSpec,
        asset: &ReleaseAsset,
        staged: &Path,
    ) -> Result<(), ProvisionError> {
        let Some(kind) = ArchiveKind::from_asset_name(&asset.name) else {
            return self.client.download(&asset.download_url, staged).await;
        };

        let archive_path = self.layout.root().join(&asset.name);
        let scratch = self.layout.extract_dir(tool);

        let result = self
            .unpack(tool, asset, kind, &archive_path, &scratch, staged)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", scratch.display(), e);
            }
        }
        remove_file_quietly(&archive_path).await;

        result
    }

    async fn unpack(
        &self,
        tool: &ToolSpec,
        asset: &ReleaseAsset,
        kind: ArchiveKind,
        archive_path: &Path,
        scratch: &Path,
        staged: &Path,
    ) -> Result<(), ProvisionError> {
        self.client.download(&asset.download_url, archive_path).await?;

        if scratch.exists() {
            tokio::fs::remove_dir_all(scratch).await?;
        }
        tokio::fs::create_dir_all(scratch).await?;

        let wanted = format!("{}{}", tool.name, self.target.exe_suffix());
        let found = {
            let archive_path = archive_path.to_path_buf();
            let scratch = scratch.to_path_buf();
            let wanted = wanted.clone();
            let limits = self.limits;
            tokio::task::spawn_blocking(move || -> Result<Option<PathBuf>, ProvisionError> {
                archive::extract(&archive_path, kind, &scratch)?;
                Ok(archive::find_file(&scratch, &wanted, limits)?)
            })
            .await
            .map_err(|e| {
                ProvisionError::ArchiveExtraction(format!("extraction task failed: {}", e))
            })??
        };

        let found = found.ok_or_else(|| {
            ProvisionError::ArchiveExtraction(format!("{} not found in {}", wanted, asset.name))
        })?;
        debug!("Found {} in archive", found.display());

        tokio::fs::copy(&found, staged).await?;
        Ok(())
    }
}

/// Mark `staged` executable and move it to its final name
async fn install(staged: &Path, dest: &Path) -> Result<(), ProvisionError> {
    make_executable(staged)?;
    tokio::fs::rename(staged, dest).await?;
    Ok(())
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::testing::FakeReleaseClient;
    use super::*;
    use crate::config::Config;
    use crate::platform::Os;
    use tempfile::TempDir;

    fn tool() -> ToolSpec {
        ToolSpec::new("tool", "https://releases.invalid/tool/latest")
    }

    fn provisioner<C: ReleaseClient>(temp: &TempDir, client: C) -> BinaryProvisioner<C> {
        let config = Config::default();
        let layout = DataLayout::new(temp.path(), &config.tools.registration, &config.tools.proxy);
        BinaryProvisioner::new(client, layout).with_target(Target::new(Os::Linux, "x86_64"))
    }

    /// Downloads normally, then puts a non-empty directory where the tool goes
    struct ObstructingClient(FakeReleaseClient);

    impl ReleaseClient for ObstructingClient {
        async fn fetch_manifest(&self, url: &str) -> Result<ReleaseManifest, ProvisionError> {
            self.0.fetch_manifest(url).await
        }

        async fn download(&self, url: &str, dest: &Path) -> Result<(), ProvisionError> {
            self.0.download(url, dest).await?;
            let final_name = dest.with_file_name(tool().executable_name());
            std::fs::create_dir_all(final_name.join("in-the-way"))?;
            Ok(())
        }
    }

    fn leftovers(temp: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_staging_path() {
        assert_eq!(staging_path(Path::new("/data/wgcf")), Path::new("/data/wgcf.part"));
        assert_eq!(
            staging_path(Path::new("/data/wgcf.exe")),
            Path::new("/data/wgcf.exe.part")
        );
    }

    #[test]
    fn test_provision_error_display() {
        let err = ProvisionError::AssetNotFound {
            tool: "wgcf".to_string(),
            platform: "linux".to_string(),
            arch: "riscv64".to_string(),
        };
        assert_eq!(err.to_string(), "Could not find wgcf binary for linux/riscv64");

        let err = ProvisionError::NetworkFetch {
            url: "https://x".to_string(),
            message: "HTTP 503 Service Unavailable".to_string(),
        };
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_present_binary_skips_network() {
        let temp = TempDir::new().unwrap();
        let client = FakeReleaseClient::new(&[]);
        let provisioner = provisioner(&temp, client);
        let path = provisioner.executable_path(&tool());
        std::fs::write(&path, b"already here").unwrap();

        assert_eq!(provisioner.ensure(&tool()).await.unwrap(), path);
        assert_eq!(provisioner.ensure(&tool()).await.unwrap(), path);
        assert_eq!(provisioner.client().calls(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn test_bare_binary_download() {
        let temp = TempDir::new().unwrap();
        let client = FakeReleaseClient::new(&["tool_windows_amd64.exe", "tool_linux_amd64"])
            .with_payload("tool_linux_amd64", b"ELF".to_vec());
        let provisioner = provisioner(&temp, client);

        let path = provisioner.ensure(&tool()).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"ELF");
        // manifest + one download
        assert_eq!(provisioner.client().calls(), 2);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        // Second call is a no-op
        provisioner.ensure(&tool()).await.unwrap();
        assert_eq!(provisioner.client().calls(), 2);
    }

    #[tokio::test]
    async fn test_tar_gz_download_is_unpacked_and_cleaned() {
        let temp = TempDir::new().unwrap();
        let archive = FakeReleaseClient::tar_gz(&[("tool_linux_amd64/tool", b"ELF-from-tar")]);
        let client = FakeReleaseClient::new(&["tool_linux_amd64.tar.gz"])
            .with_payload("tool_linux_amd64.tar.gz", archive);
        let provisioner = provisioner(&temp, client);

        let path = provisioner.ensure(&tool()).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"ELF-from-tar");

        let expected = tool().executable_name();
        assert_eq!(leftovers(&temp), vec![expected]);
    }

    #[tokio::test]
    async fn test_zip_download_is_unpacked() {
        let temp = TempDir::new().unwrap();
        let archive = FakeReleaseClient::zip(&[("dist/tool", b"ELF-from-zip")]);
        let client = FakeReleaseClient::new(&["tool_linux_amd64.zip"])
            .with_payload("tool_linux_amd64.zip", archive);
        let provisioner = provisioner(&temp, client);

        let path = provisioner.ensure(&tool()).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"ELF-from-zip");
        assert_eq!(leftovers(&temp), vec![tool().executable_name()]);
    }

    #[tokio::test]
    async fn test_archive_without_binary_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let archive = FakeReleaseClient::tar_gz(&[("README.md", b"docs only")]);
        let client = FakeReleaseClient::new(&["tool_linux_amd64.tar.gz"])
            .with_payload("tool_linux_amd64.tar.gz", archive);
        let provisioner = provisioner(&temp, client);

        let err = provisioner.ensure(&tool()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ArchiveExtraction(_)));
        assert!(err.to_string().contains("not found in tool_linux_amd64.tar.gz"));
        assert!(leftovers(&temp).is_empty());
    }

    #[tokio::test]
    async fn test_failed_install_removes_staged_file() {
        let temp = TempDir::new().unwrap();
        let client = FakeReleaseClient::new(&["tool_linux_amd64"])
            .with_payload("tool_linux_amd64", b"ELF".to_vec());
        let provisioner = provisioner(&temp, ObstructingClient(client));

        let err = provisioner.ensure(&tool()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Io(_)));
        // Only the obstruction remains; no tool.part
        assert_eq!(leftovers(&temp), vec![tool().executable_name()]);
        assert!(provisioner.executable_path(&tool()).is_dir());
    }

    #[tokio::test]
    async fn test_no_matching_asset() {
        let temp = TempDir::new().unwrap();
        let client = FakeReleaseClient::new(&["tool_darwin_arm64", "tool_windows_amd64.exe"]);
        let provisioner = provisioner(&temp, client);

        let err = provisioner.ensure(&tool()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::AssetNotFound { .. }));
        // Only the manifest was fetched
        assert_eq!(provisioner.client().calls(), 1);
        assert!(leftovers(&temp).is_empty());
    }

    #[tokio::test]
    async fn test_manifest_failure() {
        let temp = TempDir::new().unwrap();
        let client = FakeReleaseClient::failing_manifest();
        let provisioner = provisioner(&temp, client);

        let err = provisioner.ensure(&tool()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NetworkFetch { .. }));
        assert!(!provisioner.executable_path(&tool()).exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let temp = TempDir::new().unwrap();
        // Asset is listed but has no payload, so the download fails
        let client = FakeReleaseClient::new(&["tool_linux_amd64"]);
        let provisioner = provisioner(&temp, client);

        let err = provisioner.ensure(&tool()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NetworkFetch { .. }));
        assert!(leftovers(&temp).is_empty());
    }
}
