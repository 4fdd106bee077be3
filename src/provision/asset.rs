//! Release manifest parsing and asset selection
//!
//! Release feeds follow the GitHub "latest release" shape:
//!
//! ```json
//! { "assets": [ { "name": "wgcf_2.2.22_linux_amd64", "browser_download_url": "https://..." } ] }
//! ```

use crate::platform::Target;
use serde::Deserialize;

/// One downloadable artifact of a release
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseManifest {
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseManifest {
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// Pick the asset built for `target`
///
/// Tried in order, first hit wins:
/// 1. `prefix_platform_arch[.exe]`
/// 2. `prefix-platform-arch[.exe]`
/// 3. any name containing prefix, platform and arch in that order
///
/// All comparisons ignore ASCII case.
pub fn resolve_asset<'a>(
    assets: &'a [ReleaseAsset],
    prefix: &str,
    target: &Target,
) -> Option<&'a ReleaseAsset> {
    let platform = target.platform_token();
    let arch = target.arch_token();
    let ext = target.exe_suffix();

    let underscored = format!("{prefix}_{platform}_{arch}{ext}");
    let dashed = format!("{prefix}-{platform}-{arch}{ext}");

    for exact in [&underscored, &dashed] {
        if let Some(asset) = assets.iter().find(|a| a.name.eq_ignore_ascii_case(exact)) {
            return Some(asset);
        }
    }

    assets
        .iter()
        .find(|a| contains_in_order(&a.name, &[prefix, platform, &arch]))
}

/// Case-insensitive check that every needle occurs after the previous one
fn contains_in_order(haystack: &str, needles: &[&str]) -> bool {
    let haystack = haystack.to_ascii_lowercase();
    let mut rest = haystack.as_str();

    for needle in needles {
        let needle = needle.to_ascii_lowercase();
        match rest.find(&needle) {
            Some(idx) => rest = &rest[idx + needle.len()..],
            None => return false,
        }
    }

    true
}
