//! HTTP model repository provider
//!
//! The repository serves, per model version, a manifest at
//! `{baseUrl}/{name}/{version}/manifest.json` listing the files that make up
//! the artifact, and the files themselves next to it:
//!
//! ```json
//! [
//!   {"path": "saved_model.pb", "size": 123456},
//!   {"path": "variables/variables.data", "size": 7890123}
//! ]
//! ```
//!
//! Files are streamed to disk; the manifest sum is the size hint and the
//! byte count written is the authoritative artifact size.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::disk::PartialFetchGuard;
use crate::cache::{ModelArtifact, ModelId, ModelProvider};
use crate::error::Error;

/// One file of a model artifact as listed in the repository manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the model version directory
    pub path: String,
    /// Size in bytes
    pub size: u64,
}

/// Model provider backed by an HTTP repository.
pub struct HttpModelProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpModelProvider {
    /// Create a provider for the repository at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn manifest(&self, name: &str, version: i64) -> Result<Vec<ManifestEntry>, Error> {
        let url = format!("{}/{}/{}/manifest.json", self.base_url, name, version);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::provider(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ProviderMiss(format!("{}:{}", name, version)));
        }
        let response = response
            .error_for_status()
            .map_err(|e| Error::provider(e.to_string()))?;
        let entries: Vec<ManifestEntry> = response
            .json()
            .await
            .map_err(|e| Error::provider(format!("invalid manifest at {}: {}", url, e)))?;
        validate_manifest(&entries)?;
        Ok(entries)
    }

    async fn download(
        &self,
        name: &str,
        version: i64,
        entry: &ManifestEntry,
        dest: &Path,
    ) -> Result<u64, Error> {
        let url = format!("{}/{}/{}/{}", self.base_url, name, version, entry.path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::provider(e.to_string()))?;

        let file_path = dest.join(&entry.path);
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::provider(e.to_string()))?;
        }
        let mut file = tokio::fs::File::create(&file_path)
            .await
            .map_err(|e| Error::provider(e.to_string()))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::provider(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::provider(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| Error::provider(e.to_string()))?;
        Ok(written)
    }
}

fn validate_manifest(entries: &[ManifestEntry]) -> Result<(), Error> {
    for entry in entries {
        let path = Path::new(&entry.path);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::provider(format!(
                "manifest entry escapes the model directory: {}",
                entry.path
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    async fn model_size(&self, name: &str, version: i64) -> Result<u64, Error> {
        let manifest = self.manifest(name, version).await?;
        Ok(manifest.iter().map(|e| e.size).sum())
    }

    async fn fetch_model(
        &self,
        name: &str,
        version: i64,
        dest_dir: &Path,
    ) -> Result<ModelArtifact, Error> {
        let id = ModelId::new(name, version);
        info!(model = %id, "Fetching model from HTTP repository");

        let manifest = self.manifest(name, version).await?;
        let relative = format!("{}/{}", name, version);
        let dest = dest_dir.join(name).join(version.to_string());

        let mut cleanup = PartialFetchGuard::new(dest.clone());
        let mut size_bytes = 0u64;
        for entry in &manifest {
            size_bytes += self.download(name, version, entry, &dest).await?;
        }
        cleanup.disarm();

        Ok(ModelArtifact {
            id,
            path: relative,
            size_bytes,
        })
    }

    fn check(&self) -> bool {
        // The repository is probed per request; construction succeeded, so
        // report healthy and let fetch errors surface.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_deserializes() {
        let json = r#"[
            {"path": "saved_model.pb", "size": 5},
            {"path": "variables/variables.data", "size": 10}
        ]"#;
        let entries: Vec<ManifestEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].path, "variables/variables.data");
        assert_eq!(entries.iter().map(|e| e.size).sum::<u64>(), 15);
    }

    #[test]
    fn manifest_rejects_escaping_paths() {
        let entries = vec![ManifestEntry {
            path: "../outside".to_string(),
            size: 1,
        }];
        assert!(validate_manifest(&entries).is_err());

        let entries = vec![ManifestEntry {
            path: "/etc/passwd".to_string(),
            size: 1,
        }];
        assert!(validate_manifest(&entries).is_err());

        let entries = vec![ManifestEntry {
            path: "variables/variables.data".to_string(),
            size: 1,
        }];
        assert!(validate_manifest(&entries).is_ok());
    }
}
