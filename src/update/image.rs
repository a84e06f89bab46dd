//! Image download and verification

use async_trait::async_trait;
use outpost_proto::AgentError;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Retrieves an image from its manifest location into a staging file
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), AgentError>;
}

/// Streaming HTTP download
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), AgentError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AgentError::Connectivity(format!("download failed: {e}")))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| AgentError::Execution(format!("creating {}: {e}", dest.display())))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AgentError::Connectivity(format!("download interrupted: {e}")))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| AgentError::Execution(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| AgentError::Execution(e.to_string()))?;

        debug!("Downloaded {} bytes to {}", written, dest.display());
        Ok(())
    }
}

/// Compute the image's SHA-256 and compare against the manifest checksum.
/// A mismatch is fatal for the job; the caller must discard the artifact.
pub async fn verify_image(path: &Path, expected: &str) -> Result<(), AgentError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AgentError::Execution(format!("reading {}: {e}", path.display())))?;

    let computed = hex::encode(Sha256::digest(&bytes));
    if computed != expected.to_lowercase() {
        return Err(AgentError::ChecksumMismatch {
            expected: expected.to_string(),
            computed,
        });
    }
    Ok(())
}
