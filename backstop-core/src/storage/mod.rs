/*!
Object storage backends for remote tiers.

This module defines the port every off-site tier implements ([`ObjectStorage`]) and
the concrete adapters behind it. Mirroring and retention logic lives in
[`crate::remote`] and only ever talks to the port, so adding a backend never touches
the sync rules.

Backends built on async SDKs implement [`AsyncObjectStorage`] and are driven through
[`BlockingObjectStorage`], which runs them on a shared runtime.
*/

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::artifact::compute_checksum;
use crate::{BackupError, Result};

#[cfg(feature = "async-rt")]
use once_cell::sync::Lazy;
#[cfg(feature = "async-rt")]
use std::sync::Arc;
#[cfg(feature = "async-rt")]
use tokio::runtime::Runtime;

#[cfg(feature = "async-rt")]
static GLOBAL_RT: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(4))
        .enable_all()
        .build()
        .expect("Failed to create global async runtime")
});

/// Run a future to completion on the shared storage runtime.
#[cfg(feature = "async-rt")]
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    GLOBAL_RT.block_on(future)
}

/// One object as reported by a remote listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size_bytes: u64,
    /// SHA-256 recorded at upload time; `None` when the backend has no record of it
    pub checksum: Option<String>,
}

/// Storage abstraction for one remote tier
///
/// Keys are flat artifact keys; any prefix or directory layout is the adapter's
/// concern.
pub trait ObjectStorage: Send + Sync {
    /// Tier name used in reports and logs
    fn name(&self) -> &str;

    /// List objects whose key starts with `prefix`
    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// Upload the file at `source` under `key`, recording `checksum` alongside it.
    ///
    /// An existing object with the same key is replaced. Adapters must refuse the
    /// upload if the bytes they send do not hash to `checksum`.
    fn upload(&self, key: &str, source: &Path, checksum: &str) -> Result<()>;

    /// Delete `key`; fails with `NotFound` when it does not exist
    fn delete(&self, key: &str) -> Result<()>;
}

/// Async storage abstraction, implemented by SDK-backed adapters
#[async_trait]
pub trait AsyncObjectStorage: Send + Sync {
    fn name(&self) -> &str;

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    async fn upload(&self, key: &str, source: &Path, checksum: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Blocking wrapper for async storage adapters
///
/// This wrapper allows async storage implementations to be used in sync contexts
/// by using a global runtime to block on async operations.
#[cfg(feature = "async-rt")]
pub struct BlockingObjectStorage<A: AsyncObjectStorage> {
    inner: Arc<A>,
}

#[cfg(feature = "async-rt")]
impl<A: AsyncObjectStorage> BlockingObjectStorage<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            inner: Arc::new(adapter),
        }
    }
}

#[cfg(feature = "async-rt")]
impl<A: AsyncObjectStorage> ObjectStorage for BlockingObjectStorage<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        GLOBAL_RT.block_on(self.inner.list(prefix))
    }

    fn upload(&self, key: &str, source: &Path, checksum: &str) -> Result<()> {
        GLOBAL_RT.block_on(self.inner.upload(key, source, checksum))
    }

    fn delete(&self, key: &str) -> Result<()> {
        GLOBAL_RT.block_on(self.inner.delete(key))
    }
}

// Re-export types for convenience
pub use local::DirectoryObjectStorage;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStorage;

/// Memory-based object storage
///
/// Objects live in a map guarded by a mutex. Useful for tests and dry runs where
/// no remote tier should be touched.
#[derive(Debug)]
pub struct MemoryObjectStorage {
    name: String,
    objects: Mutex<BTreeMap<String, (Vec<u8>, Option<String>)>>,
}

impl MemoryObjectStorage {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, Option<String>)>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored bytes of `key`
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).map(|(data, _)| data.clone())
    }

    /// All stored keys in order
    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Place an object directly, bypassing upload checks
    pub fn insert_raw<K: Into<String>>(&self, key: K, data: Vec<u8>, checksum: Option<String>) {
        self.objects().insert(key.into(), (data, checksum));
    }
}

impl ObjectStorage for MemoryObjectStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        Ok(self
            .objects()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (data, checksum))| RemoteObject {
                key: key.clone(),
                size_bytes: data.len() as u64,
                checksum: checksum.clone(),
            })
            .collect())
    }

    fn upload(&self, key: &str, source: &Path, checksum: &str) -> Result<()> {
        let data = std::fs::read(source)?;
        let actual = compute_checksum(&data);
        if actual != checksum {
            return Err(BackupError::IntegrityCheckFailed {
                key: key.to_string(),
                expected: checksum.to_string(),
                actual,
            });
        }
        debug!(tier = %self.name, key = %key, size = data.len(), "stored object in memory");
        self.objects()
            .insert(key.to_string(), (data, Some(checksum.to_string())));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.objects().remove(key) {
            Some(_) => Ok(()),
            None => Err(BackupError::not_found(format!(
                "object '{key}' not found in tier '{}'",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn staged(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file
    }

    #[test]
    fn test_memory_storage_basic_operations() {
        let storage = MemoryObjectStorage::new("memory");
        let file = staged(b"artifact bytes");
        let checksum = compute_checksum(b"artifact bytes");

        storage
            .upload("orders_2024-05-01_0200.sql.gz", file.path(), &checksum)
            .unwrap();
        let listed = storage.list("orders_").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checksum.as_deref(), Some(checksum.as_str()));
        assert_eq!(listed[0].size_bytes, 14);

        assert!(storage.list("billing_").unwrap().is_empty());

        storage.delete("orders_2024-05-01_0200.sql.gz").unwrap();
        assert!(matches!(
            storage.delete("orders_2024-05-01_0200.sql.gz"),
            Err(BackupError::NotFound(_))
        ));
    }

    #[test]
    fn test_memory_storage_rejects_checksum_mismatch() {
        let storage = MemoryObjectStorage::new("memory");
        let file = staged(b"artifact bytes");
        let result = storage.upload("k.sql", file.path(), &compute_checksum(b"other"));
        assert!(matches!(result, Err(BackupError::IntegrityCheckFailed { .. })));
        assert!(storage.keys().is_empty());
    }
}
