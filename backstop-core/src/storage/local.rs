/*!
Directory-backed remote tier.

Mirrors artifacts into a directory, typically a mounted network share. Each object
`<key>` has a `<key>.sha256` sidecar holding the checksum recorded at upload.

A hung mount blocks filesystem calls indefinitely, so with an operation timeout set
each call runs on a helper thread and is abandoned as a `NetworkError` once the
timeout passes.
*/

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{ObjectStorage, RemoteObject};
use crate::{BackupError, Result};

const SIDECAR_SUFFIX: &str = ".sha256";

/// Directory-backed object storage
///
/// Writes go through a temporary file in the target directory followed by a rename,
/// so a reader never sees a partially copied object.
///
/// # Example
/// ```rust
/// use backstop_core::storage::{DirectoryObjectStorage, ObjectStorage};
///
/// # let dir = tempfile::TempDir::new()?;
/// let storage = DirectoryObjectStorage::new("nas", dir.path());
/// assert!(storage.list("orders_")?.is_empty());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryObjectStorage {
    name: String,
    base_dir: PathBuf,
    operation_timeout: Option<Duration>,
}

impl DirectoryObjectStorage {
    /// Create a directory tier rooted at `base_dir`
    ///
    /// # Arguments
    /// * `name` - Tier name used in reports
    /// * `base_dir` - Directory holding the mirrored objects; created on first upload
    pub fn new<S: Into<String>, P: AsRef<Path>>(name: S, base_dir: P) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.as_ref().to_path_buf(),
            operation_timeout: None,
        }
    }

    /// Bound every list, upload and delete by `timeout`
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the full path for a given key
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
            return Err(BackupError::validation(format!(
                "object key '{key}' is not a plain file name"
            )));
        }
        Ok(self.base_dir.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(SIDECAR_SUFFIX);
        PathBuf::from(sidecar)
    }

    /// Ensure the base directory exists, creating it if necessary
    fn ensure_base_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .map_err(|e| map_io_error("create directory", &self.base_dir.display().to_string(), e))
    }

    fn write_sidecar(&self, path: &Path, checksum: &str) -> io::Result<()> {
        let mut temp = NamedTempFile::new_in(&self.base_dir)?;
        temp.write_all(checksum.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(Self::sidecar_path(path)).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Map filesystem errors on the share to the remote error taxonomy.
///
/// A share that is unreachable or stalls behaves like a flaky network link and is
/// retried; permission problems are treated like rejected credentials.
fn map_io_error(op: &str, target: &str, err: io::Error) -> BackupError {
    match err.kind() {
        io::ErrorKind::NotFound => BackupError::not_found(format!("{op} {target}: {err}")),
        io::ErrorKind::PermissionDenied => {
            BackupError::auth(format!("{op} {target}: permission denied"))
        }
        _ => BackupError::network(format!("{op} {target}: {err}")),
    }
}

impl DirectoryObjectStorage {
    /// Run `op` under the operation timeout, if one is set
    fn bounded<T, F>(&self, op: &str, target: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(DirectoryObjectStorage) -> Result<T> + Send + 'static,
    {
        let Some(timeout) = self.operation_timeout else {
            return f(self.clone());
        };
        let (tx, rx) = mpsc::channel();
        let storage = self.clone();
        thread::spawn(move || {
            let _ = tx.send(f(storage));
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(tier = %self.name, op, target, ?timeout, "share did not respond in time");
                Err(BackupError::network(format!(
                    "{op} {target} on '{}' timed out after {timeout:?}",
                    self.name
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(BackupError::network(format!(
                "{op} {target} on '{}' was interrupted",
                self.name
            ))),
        }
    }

    fn list_now(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            // an empty mirror has simply not been written to yet
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_io_error("list", &self.base_dir.display().to_string(), e)),
        };

        let mut objects = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| map_io_error("list", &self.base_dir.display().to_string(), e))?;
            let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if key.starts_with('.') || key.ends_with(SIDECAR_SUFFIX) || !key.starts_with(prefix) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| map_io_error("stat", &key, e))?;
            if !metadata.is_file() {
                continue;
            }
            let checksum = fs::read_to_string(Self::sidecar_path(&entry.path()))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            objects.push(RemoteObject {
                key,
                size_bytes: metadata.len(),
                checksum,
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn upload_now(&self, key: &str, source: &Path, checksum: &str) -> Result<()> {
        let target = self.resolve_path(key)?;
        self.ensure_base_dir()?;

        let mut input = File::open(source).map_err(|e| {
            BackupError::write(format!("failed to open {}: {e}", source.display()))
        })?;
        let mut temp =
            NamedTempFile::new_in(&self.base_dir).map_err(|e| map_io_error("stage", key, e))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(BackupError::write(format!(
                        "failed to read {}: {e}",
                        source.display()
                    )))
                }
            };
            hasher.update(&buffer[..n]);
            temp.write_all(&buffer[..n])
                .map_err(|e| map_io_error("copy", key, e))?;
        }
        let actual = format!("{:x}", hasher.finalize());
        if actual != checksum {
            return Err(BackupError::IntegrityCheckFailed {
                key: key.to_string(),
                expected: checksum.to_string(),
                actual,
            });
        }

        temp.as_file()
            .sync_all()
            .map_err(|e| map_io_error("sync", key, e))?;
        temp.persist(&target)
            .map_err(|e| map_io_error("publish", key, e.error))?;
        self.write_sidecar(&target, checksum)
            .map_err(|e| map_io_error("record checksum for", key, e))?;

        info!(tier = %self.name, key = %key, path = %target.display(), "mirrored artifact");
        Ok(())
    }

    fn delete_now(&self, key: &str) -> Result<()> {
        let path = self.resolve_path(key)?;
        fs::remove_file(&path).map_err(|e| map_io_error("delete", key, e))?;
        match fs::remove_file(Self::sidecar_path(&path)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(map_io_error("delete checksum of", key, e)),
        }
        debug!(tier = %self.name, key = %key, "deleted mirrored artifact");
        Ok(())
    }
}

impl ObjectStorage for DirectoryObjectStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let prefix = prefix.to_string();
        self.bounded("list", &self.base_dir.display().to_string(), move |storage| {
            storage.list_now(&prefix)
        })
    }

    fn upload(&self, key: &str, source: &Path, checksum: &str) -> Result<()> {
        let (owned_key, source, checksum) = (key.to_string(), source.to_path_buf(), checksum.to_string());
        self.bounded("upload", key, move |storage| {
            storage.upload_now(&owned_key, &source, &checksum)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let owned_key = key.to_string();
        self.bounded("delete", key, move |storage| storage.delete_now(&owned_key))
    }
}
