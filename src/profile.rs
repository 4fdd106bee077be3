//! WireGuard profile parsing and wireproxy config rendering
//!
//! `wgcf generate` produces a standard WireGuard profile:
//!
//! ```text
//! [Interface]
//! PrivateKey = ...
//! Address = 172.16.0.2/32, fd01:5ca1:ab1e::2/128
//!
//! [Peer]
//! PublicKey = ...
//! Endpoint = engage.cloudflareclient.com:2408
//! ```
//!
//! wireproxy reads the same `[Section]` / `Key = Value` format with two extra
//! sections describing its local listeners.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Used when the profile carries no `Address`
pub const DEFAULT_ADDRESS: &str = "172.16.0.2/32, fd01:db8:1111::2/128";
pub const TUNNEL_DNS: &str = "1.1.1.1";
pub const TUNNEL_MTU: u16 = 1280;
pub const KEEPALIVE_SECS: u16 = 25;
/// Every IPv4 and IPv6 destination goes through the tunnel
pub const FULL_ROUTE: &str = "0.0.0.0/0, ::/0";

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to access profile: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to write {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Profile is missing {section}.{key}")]
    MissingField { section: String, key: String },
}

/// Parsed `[Section]` / `key=value` document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Profile {
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(name)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Check the keys wireproxy cannot run without
    pub fn validate(&self) -> Result<(), ProfileError> {
        for (section, key) in [
            ("Interface", "PrivateKey"),
            ("Peer", "PublicKey"),
            ("Peer", "Endpoint"),
        ] {
            if self.get(section, key).is_none_or(str::is_empty) {
                return Err(ProfileError::MissingField {
                    section: section.to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Parse a WireGuard-style profile
///
/// A trimmed line `[Name]` opens a section. Within a section, a line
/// `key=value` is split at the first `=` and both halves trimmed. Anything
/// else, including lines before the first section, is ignored.
pub fn parse_profile(text: &str) -> Profile {
    let mut profile = Profile::default();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let name = name.to_string();
            profile.sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let Some(section) = current.as_ref() else {
            continue;
        };
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        profile
            .sections
            .entry(section.clone())
            .or_default()
            .insert(key.to_string(), value.trim().to_string());
    }

    profile
}

/// Local listener addresses baked into the wireproxy config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddrs {
    pub host: String,
    pub socks_port: u16,
    pub http_port: u16,
}

impl ListenAddrs {
    pub fn socks_bind(&self) -> String {
        format!("{}:{}", self.host, self.socks_port)
    }

    pub fn http_bind(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

/// Render the wireproxy configuration for `profile`
///
/// `AllowedIPs` is always [`FULL_ROUTE`], whatever the profile says.
pub fn render_proxy_config(profile: &Profile, listen: &ListenAddrs) -> String {
    let field = |section: &str, key: &str| profile.get(section, key).unwrap_or_default();
    let address = profile
        .get("Interface", "Address")
        .filter(|a| !a.is_empty())
        .unwrap_or(DEFAULT_ADDRESS);

    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}\n\
         DNS = {TUNNEL_DNS}\n\
         MTU = {TUNNEL_MTU}\n\
         \n\
         [Peer]\n\
         PublicKey = {public_key}\n\
         Endpoint = {endpoint}\n\
         AllowedIPs = {FULL_ROUTE}\n\
         PersistentKeepalive = {KEEPALIVE_SECS}\n\
         \n\
         [Socks5]\n\
         BindAddress = {socks}\n\
         \n\
         [http]\n\
         BindAddress = {http}\n",
        private_key = field("Interface", "PrivateKey"),
        public_key = field("Peer", "PublicKey"),
        endpoint = field("Peer", "Endpoint"),
        socks = listen.socks_bind(),
        http = listen.http_bind(),
    )
}

/// Write the wireproxy config derived from `profile_path`, unless one exists
///
/// Returns `true` when a new file was written. An existing config is never
/// touched, even when its listener no longer matches `listen`. The file is
/// written next to `config_path` first and renamed into place, so a failed
/// write never leaves a partial config behind.
pub fn ensure_proxy_config(
    profile_path: &Path,
    config_path: &Path,
    listen: &ListenAddrs,
) -> Result<bool, ProfileError> {
    if config_path.exists() {
        debug!("Proxy config present at {}", config_path.display());
        warn_on_listener_drift(config_path, listen);
        return Ok(false);
    }

    info!("Generating wireproxy config...");
    let text = std::fs::read_to_string(profile_path)?;
    let profile = parse_profile(&text);
    debug!("Parsed profile sections: {:?}", profile.section_names().collect::<Vec<_>>());
    profile.validate()?;

    let rendered = render_proxy_config(&profile, listen);
    let staged = staging_path(config_path);
    if let Err(source) = write_staged(&staged, config_path, &rendered) {
        if let Err(e) = std::fs::remove_file(&staged) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", staged.display(), e);
            }
        }
        return Err(ProfileError::WriteConfig {
            path: config_path.to_path_buf(),
            source,
        });
    }

    info!("wireproxy config written to {}", config_path.display());
    Ok(true)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn write_staged(staged: &Path, dest: &Path, contents: &str) -> io::Result<()> {
    let mut file = File::create(staged)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(staged, dest)
}

fn warn_on_listener_drift(config_path: &Path, listen: &ListenAddrs) {
    let Ok(text) = std::fs::read_to_string(config_path) else {
        return;
    };
    let existing = parse_profile(&text);
    let expected = listen.socks_bind();
    match existing.get("Socks5", "BindAddress") {
        Some(bind) if bind == expected => {}
        other => warn!(
            "Existing {} listens on {:?}, configured {}; delete it to regenerate",
            config_path.display(),
            other,
            expected
        ),
    }
}
