//! Blob store adapter: put/get primitives keyed by trajectory id.
//!
//! The production deployment points this at an object store; the
//! filesystem implementation persists under a state root for local runs
//! and the in-memory one backs tests. Puts are idempotent; the latest
//! write for a key wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use ec_domain::{Error, Result};

/// Object key for a trajectory artifact, e.g. `trajectories/<id>/trace.parquet`.
pub fn trajectory_key(trajectory_id: &str, artifact: &str) -> String {
    format!("trajectories/{trajectory_id}/{artifact}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Minimal blob surface the core consumes.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob under `key`, returning its URI.
    async fn put(&self, key: &str, contents: Vec<u8>) -> Result<String>;

    /// Fetch a blob; `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// The URI a key resolves to, without touching the blob.
    fn uri(&self, key: &str) -> String;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Blob store held entirely in memory. Test and dry-run backend.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently present, sorted. Handy in assertions.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, contents: Vec<u8>) -> Result<String> {
        self.blobs.write().insert(key.to_owned(), contents);
        Ok(self.uri(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn uri(&self, key: &str) -> String {
        format!("mem://{key}")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filesystem store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Blob store persisting under a local state root.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are internal, but reject traversal anyway.
        if key.split('/').any(|c| c == "..") {
            return Err(Error::Store(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, contents: Vec<u8>) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a concurrent reader never sees a torn blob.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(self.uri(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn uri(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}

impl FsBlobStore {
    pub fn root(&self) -> &Path {
        &self.root
    }
}
