//! In-memory release feed for tests

use super::asset::{ReleaseAsset, ReleaseManifest};
use super::client::ReleaseClient;
use super::ProvisionError;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

const BASE_URL: &str = "https://downloads.invalid/";

/// Serves a fixed manifest and fixed asset bytes, counting every request
pub(crate) struct FakeReleaseClient {
    manifest: Option<ReleaseManifest>,
    payloads: HashMap<String, Vec<u8>>,
    calls: AtomicUsize,
}

impl FakeReleaseClient {
    pub(crate) fn new(asset_names: &[&str]) -> Self {
        let assets = asset_names
            .iter()
            .map(|name| ReleaseAsset {
                name: name.to_string(),
                download_url: format!("{BASE_URL}{name}"),
            })
            .collect();

        Self {
            manifest: Some(ReleaseManifest { assets }),
            payloads: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_manifest() -> Self {
        Self {
            manifest: None,
            payloads: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_payload(mut self, asset_name: &str, bytes: Vec<u8>) -> Self {
        self.payloads.insert(format!("{BASE_URL}{asset_name}"), bytes);
        self
    }

    /// Total manifest fetches plus downloads so far
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    pub(crate) fn zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (path, contents) in files {
            writer
                .start_file(*path, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}

impl ReleaseClient for FakeReleaseClient {
    async fn fetch_manifest(&self, url: &str) -> Result<ReleaseManifest, ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.manifest.clone().ok_or_else(|| ProvisionError::NetworkFetch {
            url: url.to_string(),
            message: "HTTP 503 Service Unavailable".to_string(),
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .payloads
            .get(url)
            .ok_or_else(|| ProvisionError::NetworkFetch {
                url: url.to_string(),
                message: "HTTP 404 Not Found".to_string(),
            })?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }
}
