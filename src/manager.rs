//! WARP proxy manager
//!
//! The only entry point the host application needs. `enable` runs the full
//! pipeline, stopping at the first failing stage:
//!
//! 1. data directory
//! 2. `wgcf` and `wireproxy` binaries
//! 3. WARP account, then WireGuard profile
//! 4. wireproxy config
//! 5. wireproxy process, plus a short grace period for its listeners
//!
//! Completed stages are not rolled back; every stage is create-if-absent so
//! the next `enable` picks up where the last one failed.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ProxyManager::new(Config::discover()?)?;
//! let response = manager.enable().await;
//! if response.success {
//!     let directive = manager.proxy_config(); // socks5://127.0.0.1:40000
//! }
//! manager.cleanup().await;
//! ```

use crate::account::{AccountRegistrar, RegistrationError};
use crate::config::{Config, ConfigError};
use crate::paths::DataLayout;
use crate::platform::{get_terminator, PlatformError};
use crate::profile::{ensure_proxy_config, ListenAddrs, ProfileError};
use crate::provision::{BinaryProvisioner, HttpReleaseClient, ProvisionError, ReleaseClient};
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Bypass rule understood by Chromium-style proxy settings
pub const LOCAL_BYPASS: &str = "<local>";

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to set up HTTP client: {0}")]
    HttpClient(#[source] ProvisionError),
    #[error("Failed to download {tool}: {source}")]
    Download {
        tool: String,
        #[source]
        source: ProvisionError,
    },
    #[error("Failed to register WARP account: {0}")]
    Register(#[source] RegistrationError),
    #[error("Failed to generate WireGuard profile: {0}")]
    GenerateProfile(#[source] RegistrationError),
    #[error("Failed to generate wireproxy config: {0}")]
    ProxyConfig(#[from] ProfileError),
    #[error("Failed to start wireproxy: {0}")]
    Start(#[from] SupervisorError),
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("{0}")]
    Config(#[from] ConfigError),
}

/// Result of [`ProxyManager::enable`], serialized for the host UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socks_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnableResponse {
    fn enabled(listen: ListenAddrs) -> Self {
        Self {
            success: true,
            host: Some(listen.host),
            socks_port: Some(listen.socks_port),
            http_port: Some(listen.http_port),
            error: None,
        }
    }

    fn failed(err: &ManagerError) -> Self {
        Self {
            success: false,
            host: None,
            socks_port: None,
            http_port: None,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisableResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub enabled: bool,
    pub host: String,
    pub socks_port: u16,
    /// Set when the proxy died on its own since the last start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Proxy settings for the host's network stack
///
/// An empty `proxy_rules` means "connect directly".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyDirective {
    pub proxy_rules: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_bypass_rules: Option<String>,
}

impl ProxyDirective {
    pub fn direct() -> Self {
        Self {
            proxy_rules: String::new(),
            proxy_bypass_rules: None,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.proxy_rules.is_empty()
    }
}

pub struct ProxyManager<C = HttpReleaseClient> {
    config: Config,
    layout: DataLayout,
    provisioner: BinaryProvisioner<C>,
    registrar: AccountRegistrar,
    supervisor: ProcessSupervisor,
    /// Serializes enable/disable so they never race on files or the process
    operation: Mutex<()>,
}

impl ProxyManager<HttpReleaseClient> {
    pub fn new(config: Config) -> Result<Self, ManagerError> {
        let client = HttpReleaseClient::new(&config.http).map_err(ManagerError::HttpClient)?;
        Self::with_client(config, client)
    }
}

impl<C: ReleaseClient> ProxyManager<C> {
    pub fn with_client(config: Config, client: C) -> Result<Self, ManagerError> {
        config.validate()?;
        let layout = DataLayout::from_config(&config);
        let supervisor = ProcessSupervisor::new(
            layout.proxy_exe(),
            layout.proxy_config(),
            get_terminator()?,
            config.proxy.stop_timeout(),
        );

        Ok(Self {
            provisioner: BinaryProvisioner::new(client, layout.clone()),
            registrar: AccountRegistrar::new(&layout),
            supervisor,
            layout,
            config,
            operation: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn listen_addrs(&self) -> ListenAddrs {
        ListenAddrs {
            host: self.config.proxy.host.clone(),
            socks_port: self.config.proxy.socks_port,
            http_port: self.config.proxy.http_port(),
        }
    }

    /// Provision everything and start the proxy
    pub async fn enable(&self) -> EnableResponse {
        let _guard = self.operation.lock().await;

        match self.try_enable().await {
            Ok(listen) => EnableResponse::enabled(listen),
            Err(e) => {
                error!("Failed to enable WARP proxy: {}", e);
                EnableResponse::failed(&e)
            }
        }
    }

    async fn try_enable(&self) -> Result<ListenAddrs, ManagerError> {
        self.prepare().await?;
        self.supervisor.start()?;

        // Give wireproxy a moment to bind its listeners
        tokio::time::sleep(self.config.proxy.startup_grace()).await;

        let listen = self.listen_addrs();
        info!("WARP proxy enabled on {}", listen.socks_bind());
        Ok(listen)
    }

    /// Run every stage short of starting the proxy
    pub async fn provision(&self) -> Result<(), ManagerError> {
        let _guard = self.operation.lock().await;
        self.prepare().await
    }

    async fn prepare(&self) -> Result<(), ManagerError> {
        self.layout
            .ensure_root()
            .map_err(|source| ManagerError::DataDir {
                path: self.layout.root().to_path_buf(),
                source,
            })?;

        for tool in [&self.config.tools.registration, &self.config.tools.proxy] {
            self.provisioner
                .ensure(tool)
                .await
                .map_err(|source| ManagerError::Download {
                    tool: tool.name.clone(),
                    source,
                })?;
        }

        self.registrar
            .ensure_account()
            .await
            .map_err(ManagerError::Register)?;
        self.registrar
            .ensure_profile()
            .await
            .map_err(ManagerError::GenerateProfile)?;

        ensure_proxy_config(
            &self.layout.profile(),
            &self.layout.proxy_config(),
            &self.listen_addrs(),
        )?;

        Ok(())
    }

    /// Stop the proxy; always succeeds
    pub async fn disable(&self) -> DisableResponse {
        let _guard = self.operation.lock().await;
        self.supervisor.stop().await;
        DisableResponse { success: true }
    }

    /// Shutdown hook for the host application
    pub async fn cleanup(&self) {
        self.disable().await;
    }

    pub fn is_enabled(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn status(&self) -> ProxyStatus {
        ProxyStatus {
            enabled: self.is_enabled(),
            host: self.config.proxy.host.clone(),
            socks_port: self.config.proxy.socks_port,
            error: self.supervisor.last_exit().map(|exit| exit.to_string()),
        }
    }

    pub fn proxy_config(&self) -> ProxyDirective {
        if !self.is_enabled() {
            return ProxyDirective::direct();
        }

        ProxyDirective {
            proxy_rules: format!("socks5://{}", self.listen_addrs().socks_bind()),
            proxy_bypass_rules: Some(LOCAL_BYPASS.to_string()),
        }
    }
}
