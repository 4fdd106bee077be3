//! WARP proxy - local SOCKS5/HTTP proxy over Cloudflare WARP
//!
//! This crate runs a userspace WireGuard tunnel to Cloudflare WARP and
//! exposes it as a local proxy. No system-wide VPN, no elevated privileges:
//! traffic only goes through WARP when an application is pointed at the proxy.
//!
//! Two third-party tools do the heavy lifting. `wgcf` registers a WARP
//! account and produces a WireGuard profile; `wireproxy` runs the tunnel and
//! the proxy listeners. Both are downloaded on first use from their GitHub
//! releases.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `paths`: Data directory layout
//! - `platform`: OS/arch detection and process termination
//! - `provision`: Release lookup, download and unpacking of the tools
//! - `account`: WARP registration and profile generation via `wgcf`
//! - `profile`: WireGuard profile parsing and wireproxy config rendering
//! - `supervisor`: wireproxy process lifecycle
//! - `manager`: The enable/disable facade tying it all together
//!
//! # Usage
//!
//! ```bash
//! warp-proxy up        # provision, start, hold until Ctrl+C
//! warp-proxy status    # show what is already on disk
//! ```

pub mod account;
pub mod config;
pub mod manager;
pub mod paths;
pub mod platform;
pub mod profile;
pub mod provision;
pub mod supervisor;

#[cfg(all(test, unix))]
mod test_support;

pub use config::Config;
pub use manager::{
    DisableResponse, EnableResponse, ManagerError, ProxyDirective, ProxyManager, ProxyStatus,
};
pub use paths::DataLayout;
