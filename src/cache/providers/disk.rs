//! Local directory model provider
//!
//! The repository is a directory tree `{baseDir}/{name}/{version}/...` where
//! the version segment is a decimal integer. Version directories are matched
//! numerically, so `000000042` and `42` name the same model version.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::{ModelArtifact, ModelId, ModelProvider};
use crate::error::Error;

/// Model provider backed by a local directory repository.
pub struct DiskModelProvider {
    base_dir: PathBuf,
}

impl DiskModelProvider {
    /// Create a provider rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve the source directory for a model version.
    ///
    /// Directory names are compared as integers; with several matches the
    /// last one wins (logged).
    async fn find_version_dir(&self, name: &str, version: i64) -> Result<PathBuf, Error> {
        let model_dir = self.base_dir.join(name);
        let mut entries = tokio::fs::read_dir(&model_dir)
            .await
            .map_err(|_| Error::ProviderMiss(format!("{}:{}", name, version)))?;

        let mut matched: Option<PathBuf> = None;
        let mut matches = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::provider(e.to_string()))?
        {
            let file_name = entry.file_name();
            let Some(dir_version) = file_name.to_str().and_then(|s| s.parse::<i64>().ok()) else {
                continue;
            };
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if dir_version == version && is_dir {
                matches += 1;
                matched = Some(entry.path());
            }
        }

        if matches > 1 {
            warn!(
                model = name,
                version, matches, "Several matching model directories found, using the last"
            );
        }
        matched.ok_or_else(|| Error::ProviderMiss(format!("{}:{}", name, version)))
    }
}

#[async_trait]
impl ModelProvider for DiskModelProvider {
    async fn model_size(&self, name: &str, version: i64) -> Result<u64, Error> {
        let src = self.find_version_dir(name, version).await?;
        dir_size(&src).await
    }

    async fn fetch_model(
        &self,
        name: &str,
        version: i64,
        dest_dir: &Path,
    ) -> Result<ModelArtifact, Error> {
        let id = ModelId::new(name, version);
        info!(model = %id, "Copying model from disk repository");

        let src = self.find_version_dir(name, version).await?;
        let relative = format!("{}/{}", name, version);
        let dest = dest_dir.join(name).join(version.to_string());

        let mut cleanup = PartialFetchGuard::new(dest.clone());
        let size_bytes = copy_dir(&src, &dest).await?;
        cleanup.disarm();

        Ok(ModelArtifact {
            id,
            path: relative,
            size_bytes,
        })
    }

    fn check(&self) -> bool {
        self.base_dir.is_dir()
    }
}

/// Sum of file sizes under a directory, recursively.
async fn dir_size(root: &Path) -> Result<u64, Error> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::provider(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::provider(e.to_string()))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| Error::provider(e.to_string()))?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Copy a directory tree, returning the total bytes copied.
async fn copy_dir(src: &Path, dest: &Path) -> Result<u64, Error> {
    let mut total = 0u64;
    let mut stack = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((src_dir, dest_dir)) = stack.pop() {
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| Error::provider(e.to_string()))?;
        let mut entries = tokio::fs::read_dir(&src_dir)
            .await
            .map_err(|e| Error::provider(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::provider(e.to_string()))?
        {
            let from = entry.path();
            let to = dest_dir.join(entry.file_name());
            let meta = entry
                .metadata()
                .await
                .map_err(|e| Error::provider(e.to_string()))?;
            if meta.is_dir() {
                stack.push((from, to));
            } else {
                total += tokio::fs::copy(&from, &to)
                    .await
                    .map_err(|e| Error::provider(e.to_string()))?;
            }
        }
    }
    Ok(total)
}

/// Best-effort removal of a half-written destination when a fetch is
/// cancelled mid-flight.
pub(crate) struct PartialFetchGuard {
    path: PathBuf,
    armed: bool,
}

impl PartialFetchGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFetchGuard {
    fn drop(&mut self) {
        if self.armed {
            let path = self.path.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = tokio::fs::remove_dir_all(&path).await;
                });
            }
        }
    }
}
