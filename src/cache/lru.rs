//! Bounded LRU of model artifacts on local disk
//!
//! Tracks artifacts by byte size against a fixed capacity. Eviction is strict
//! LRU by access; evicted artifacts are deleted from disk. The cache may
//! momentarily exceed capacity when a single admission is larger than what
//! eviction can free ("over-commit") — the caller must still be served.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{ModelArtifact, ModelId};

/// LRU cache of on-disk model artifacts, bounded by total bytes.
///
/// Reads (`get`, `list_models`) take `&self`; recency updates go through an
/// internal mutex so the owner can wrap the whole cache in a reader/writer
/// lock and keep the hit path concurrent. Mutations (`put`,
/// `ensure_free_bytes`) take `&mut self` and belong on the writer side.
pub struct LruDiskCache {
    base_dir: PathBuf,
    capacity: u64,
    current_bytes: u64,
    entries: HashMap<ModelId, ModelArtifact>,
    /// Most recently used at the front
    order: Mutex<VecDeque<ModelId>>,
}

impl LruDiskCache {
    /// Create an empty cache rooted at `base_dir` with the given capacity in
    /// bytes. Nothing already under `base_dir` is recovered.
    pub fn new(base_dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            capacity,
            current_bytes: 0,
            entries: HashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Look up an artifact and move it to the most-recently-used position.
    ///
    /// Does not check the disk; callers that need the on-disk guarantee stat
    /// the artifact path themselves.
    pub fn get(&self, id: &ModelId) -> Option<ModelArtifact> {
        let artifact = self.entries.get(id)?.clone();
        self.touch(id);
        Some(artifact)
    }

    /// Admit an artifact, evicting least-recently-used entries as needed.
    ///
    /// If the id is already present only its recency changes; the stored
    /// artifact is kept as-is.
    pub async fn put(&mut self, artifact: ModelArtifact) {
        if self.entries.contains_key(&artifact.id) {
            self.touch(&artifact.id);
            return;
        }
        self.ensure_free_bytes(artifact.size_bytes).await;
        self.order.get_mut().push_front(artifact.id.clone());
        self.current_bytes += artifact.size_bytes;
        self.entries.insert(artifact.id.clone(), artifact);
    }

    /// Evict least-recently-used artifacts until `bytes` fit within capacity.
    ///
    /// Disk deletion failures are logged and do not block the in-memory
    /// eviction. If the cache drains completely and the bytes still do not
    /// fit, the shortfall is logged and the caller proceeds over capacity.
    pub async fn ensure_free_bytes(&mut self, bytes: u64) {
        loop {
            let evicted = {
                let order = self.order.get_mut();
                if order.is_empty() || self.capacity.saturating_sub(self.current_bytes) >= bytes {
                    break;
                }
                order.pop_back()
            };
            let Some(id) = evicted else { break };
            let Some(artifact) = self.entries.remove(&id) else {
                continue;
            };
            info!(model = %id, path = %artifact.path, "Evicting model");
            self.remove_from_disk(&artifact).await;
            self.current_bytes = self.current_bytes.saturating_sub(artifact.size_bytes);
        }
        if self.capacity.saturating_sub(self.current_bytes) < bytes {
            warn!(
                capacity = self.capacity,
                current = self.current_bytes,
                requested = bytes,
                "Cannot free requested bytes; cache will exceed capacity"
            );
        }
    }

    /// All artifacts, most recently used first.
    pub fn list_models(&self) -> Vec<ModelArtifact> {
        let order = self.order.lock();
        order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    /// Absolute path of an artifact under the cache root.
    pub fn model_path(&self, artifact: &ModelArtifact) -> PathBuf {
        self.base_dir.join(&artifact.path)
    }

    /// Cache root directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Total bytes currently accounted for.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    fn touch(&self, id: &ModelId) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|x| x == id) {
            if let Some(id) = order.remove(pos) {
                order.push_front(id);
            }
        }
    }

    async fn remove_from_disk(&self, artifact: &ModelArtifact) {
        let disk_path = self.model_path(artifact);
        let meta = match tokio::fs::metadata(&disk_path).await {
            Ok(meta) => meta,
            // Already gone; nothing to delete.
            Err(_) => return,
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&disk_path).await
        } else {
            tokio::fs::remove_file(&disk_path).await
        };
        if let Err(e) = result {
            error!(
                path = %disk_path.display(),
                error = %e,
                "Could not delete evicted model from disk"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(name: &str, version: i64, size: u64) -> ModelArtifact {
        ModelArtifact {
            id: ModelId::new(name, version),
            path: format!("{}/{}", name, version),
            size_bytes: size,
        }
    }

    #[tokio::test]
    async fn put_then_get_returns_artifact() {
        let mut cache = LruDiskCache::new("/nonexistent", 1024);
        cache.put(artifact("foo", 42, 10)).await;
        let got = cache.get(&ModelId::new("foo", 42)).unwrap();
        assert_eq!(got.path, "foo/42");
        assert_eq!(got.size_bytes, 10);
        assert_eq!(cache.current_bytes(), 10);
    }

    #[tokio::test]
    async fn get_absent_returns_none() {
        let cache = LruDiskCache::new("/nonexistent", 1024);
        assert!(cache.get(&ModelId::new("foo", 42)).is_none());
    }

    #[tokio::test]
    async fn put_same_id_twice_keeps_one_entry() {
        let mut cache = LruDiskCache::new("/nonexistent", 1024);
        cache.put(artifact("foo", 1, 10)).await;
        cache.put(artifact("foo", 1, 10)).await;
        assert_eq!(cache.list_models().len(), 1);
        assert_eq!(cache.current_bytes(), 10);
    }

    #[tokio::test]
    async fn evicts_lru_on_sequential_access() {
        let mut cache = LruDiskCache::new("/nonexistent", 95);
        for version in 1..=10 {
            cache.put(artifact("foo", version, 10)).await;
        }
        // Admitting the tenth model pushed total bytes to 100 > 95, evicting
        // the least recently used entry (version 1).
        assert!(cache.get(&ModelId::new("foo", 1)).is_none());
        assert!(cache.get(&ModelId::new("foo", 2)).is_some());
        assert_eq!(cache.current_bytes(), 90);
    }

    #[tokio::test]
    async fn recent_access_shields_entry_from_eviction() {
        let mut cache = LruDiskCache::new("/nonexistent", 100);
        for version in 1..=10 {
            cache.put(artifact("foo", version, 10)).await;
        }
        // Touch version 1, making version 2 the LRU.
        assert!(cache.get(&ModelId::new("foo", 1)).is_some());

        cache.put(artifact("foo", 11, 10)).await;

        assert!(cache.get(&ModelId::new("foo", 1)).is_some());
        assert!(cache.get(&ModelId::new("foo", 2)).is_none());
    }

    #[tokio::test]
    async fn evicts_by_size_with_variable_entries() {
        let mut cache = LruDiskCache::new("/nonexistent", 100);
        for version in (1..=4).rev() {
            cache.put(artifact("foo", version, 10 * version as u64)).await;
        }
        // MRU order is now 1, 2, 3, 4 with 100 bytes total. Admitting 20
        // bytes evicts version 4 (40 bytes).
        cache.put(artifact("foo", 5, 20)).await;
        assert!(cache.get(&ModelId::new("foo", 4)).is_none());
        assert_eq!(cache.current_bytes(), 80);
        assert_eq!(cache.list_models().len(), 4);

        // 20 more bytes fit exactly; no eviction.
        cache.put(artifact("foo", 6, 20)).await;
        assert_eq!(cache.list_models().len(), 5);
        assert_eq!(cache.current_bytes(), 100);
    }

    #[tokio::test]
    async fn list_is_mru_ordered() {
        let mut cache = LruDiskCache::new("/nonexistent", 1024);
        cache.put(artifact("a", 1, 1)).await;
        cache.put(artifact("b", 1, 1)).await;
        cache.put(artifact("c", 1, 1)).await;
        cache.get(&ModelId::new("a", 1));
        let names: Vec<String> = cache
            .list_models()
            .into_iter()
            .map(|m| m.id.name)
            .collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn draining_all_entries_empties_the_cache() {
        let mut cache = LruDiskCache::new("/nonexistent", 1024);
        cache.put(artifact("foo", 1, 10)).await;
        cache.put(artifact("foo", 2, 10)).await;
        cache.ensure_free_bytes(u64::MAX).await;
        assert!(cache.list_models().is_empty());
        assert_eq!(cache.current_bytes(), 0);
    }

    #[tokio::test]
    async fn oversized_admission_overcommits_after_draining() {
        let mut cache = LruDiskCache::new("/nonexistent", 5);
        cache.put(artifact("small", 1, 3)).await;
        cache.put(artifact("big", 1, 10)).await;
        // The old entry is evicted, the new one admitted over capacity.
        assert!(cache.get(&ModelId::new("small", 1)).is_none());
        assert!(cache.get(&ModelId::new("big", 1)).is_some());
        assert_eq!(cache.current_bytes(), 10);
    }

    #[tokio::test]
    async fn eviction_deletes_artifact_directory() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("foo").join("1");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("weights.bin"), b"0123456789").unwrap();

        let mut cache = LruDiskCache::new(dir.path(), 10);
        cache.put(artifact("foo", 1, 10)).await;
        cache.put(artifact("foo", 2, 10)).await;

        assert!(!model_dir.exists());
        assert!(cache.get(&ModelId::new("foo", 1)).is_none());
    }
}
