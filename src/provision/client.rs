//! HTTP access to release feeds and release assets

use super::ProvisionError;
use super::asset::ReleaseManifest;
use crate::config::HttpSettings;
use reqwest::redirect::Policy;
use reqwest::{Client, header};
use std::future::Future;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Source of release manifests and asset bytes
///
/// Both operations follow redirect chains. Implementations must write
/// downloads to exactly `dest` and nothing else.
pub trait ReleaseClient: Send + Sync {
    fn fetch_manifest(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<ReleaseManifest, ProvisionError>> + Send;

    fn download(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;
}

/// `ReleaseClient` backed by reqwest
#[derive(Clone)]
pub struct HttpReleaseClient {
    client: Client,
}

impl HttpReleaseClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, ProvisionError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .redirect(Policy::limited(settings.max_redirects))
            .build()
            .map_err(|e| ProvisionError::NetworkFetch {
                url: String::new(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    async fn get(&self, url: &str, accept: &str) -> Result<reqwest::Response, ProvisionError> {
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, accept)
            .send()
            .await
            .map_err(|e| fetch_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::NetworkFetch {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            });
        }

        Ok(response)
    }
}

impl ReleaseClient for HttpReleaseClient {
    async fn fetch_manifest(&self, url: &str) -> Result<ReleaseManifest, ProvisionError> {
        info!("Fetching release manifest {}", url);

        let body = self
            .get(url, "application/json")
            .await?
            .text()
            .await
            .map_err(|e| fetch_error(url, e))?;

        ReleaseManifest::from_json(&body).map_err(|e| ProvisionError::InvalidManifest {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ProvisionError> {
        info!("Downloading {}", url);

        let mut response = self.get(url, "application/octet-stream").await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| fetch_error(url, e))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Wrote {} bytes to {}", written, dest.display());
        Ok(())
    }
}

fn fetch_error(url: &str, err: reqwest::Error) -> ProvisionError {
    let message = if err.is_redirect() {
        format!("too many redirects: {}", err)
    } else {
        err.to_string()
    };

    ProvisionError::NetworkFetch {
        url: url.to_string(),
        message,
    }
}
