//! Model provider seam
//!
//! A provider is the backing store artifacts are fetched from on a cache
//! miss. The size call is an eviction hint only; the authoritative byte count
//! comes from the fetch itself.

use std::path::Path;

use async_trait::async_trait;

use super::ModelArtifact;
use crate::error::Error;

/// Backing store for model artifacts, addressed by (name, version).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Size in bytes of the artifact, used to free cache space ahead of the
    /// fetch.
    async fn model_size(&self, name: &str, version: i64) -> Result<u64, Error>;

    /// Materialize the artifact under `dest_dir/{name}/{version}/`, including
    /// subdirectories. Idempotent on retry. Returns the artifact with its
    /// relative path and the total bytes actually written.
    async fn fetch_model(
        &self,
        name: &str,
        version: i64,
        dest_dir: &Path,
    ) -> Result<ModelArtifact, Error>;

    /// Whether the backing store is reachable.
    fn check(&self) -> bool;
}
