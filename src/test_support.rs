//! Shell-script stand-ins for the external tools

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write an executable `/bin/sh` script at `path`
pub(crate) fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// A registration tool that writes the account and profile into its cwd
pub(crate) const FAKE_WGCF: &str = r#"
case "$1" in
  register)
    [ "$2" = "--accept-tos" ] || { echo "terms not accepted" >&2; exit 2; }
    printf 'access_token = "tok"\ndevice_id = "dev"\n' > wgcf-account.toml
    ;;
  generate)
    [ -f wgcf-account.toml ] || { echo "no account" >&2; exit 3; }
    {
      printf '[Interface]\nPrivateKey = cHJpdmF0ZQ==\n'
      printf 'Address = 172.16.0.2/32, fd01:5ca1:ab1e::2/128\nDNS = 1.1.1.1\nMTU = 1280\n\n'
      printf '[Peer]\nPublicKey = cHVibGlj\nAllowedIPs = 0.0.0.0/0\n'
      printf 'Endpoint = engage.cloudflareclient.com:2408\n'
    } > wgcf-profile.conf
    ;;
  *)
    echo "unknown command $1" >&2
    exit 1
    ;;
esac
"#;
