/*!
Durable local tier.

Artifacts live as plain files in one directory, each with a JSON manifest sidecar
(`<key>.manifest.json`) that records size, checksum, creation time and state.
Persistence streams into a temporary file in the same directory and publishes it
with an atomic no-clobber rename, so a failed or interrupted write never leaves a
file under an artifact key.
*/

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use backstop_retry::{retry, RetryPolicy};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::artifact::{checksum_reader, Artifact, ArtifactState, Tier};
use crate::naming::ArtifactNamer;
use crate::{BackupError, Result};

const MANIFEST_SUFFIX: &str = ".manifest.json";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Local filesystem tier and sole owner of local artifact state
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    retry: RetryPolicy,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| BackupError::from_write_error(e, format!("create {}", root.display())))?;
        Ok(Self {
            root,
            retry: RetryPolicy::local_storage(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an artifact's data file
    pub fn path_of(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
            return Err(BackupError::validation(format!(
                "artifact key '{key}' is not a plain file name"
            )));
        }
        Ok(self.root.join(key))
    }

    fn manifest_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(format!("{key}{MANIFEST_SUFFIX}")))
    }

    /// Stream `input` into a new artifact under `key`.
    ///
    /// The returned artifact is `Pending`; call [`LocalStore::verify`] before it is
    /// used for sync or retention. Read errors are classified as source or transform
    /// failures, write errors as `DiskFull` or `Write`. Nothing is left under `key`
    /// on failure.
    pub fn persist(
        &self,
        key: &str,
        database: &str,
        created_at: DateTime<Utc>,
        input: &mut dyn Read,
    ) -> Result<Artifact> {
        self.persist_with(key, database, created_at, input, |file| file)
    }

    /// `persist`, writing through whatever `wrap` builds around the temporary file.
    fn persist_with<W: Write>(
        &self,
        key: &str,
        database: &str,
        created_at: DateTime<Utc>,
        input: &mut dyn Read,
        wrap: impl FnOnce(File) -> W,
    ) -> Result<Artifact> {
        let target = self.path_of(key)?;
        if target.exists() {
            return Err(BackupError::DuplicateKey(format!(
                "local artifact '{key}' already exists"
            )));
        }

        let temp = NamedTempFile::new_in(&self.root)
            .map_err(|e| BackupError::from_write_error(e, "create temporary file"))?;
        let mut out = temp
            .as_file()
            .try_clone()
            .map(wrap)
            .map_err(|e| BackupError::from_write_error(e, "open temporary file"))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut size_bytes = 0u64;
        loop {
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // dropping `temp` removes the partial file
                Err(e) => return Err(BackupError::from_stream_error(e)),
            };
            hasher.update(&buffer[..n]);
            out.write_all(&buffer[..n])
                .map_err(|e| BackupError::from_write_error(e, format!("write {key}")))?;
            size_bytes += n as u64;
        }
        out.flush()
            .map_err(|e| BackupError::from_write_error(e, format!("write {key}")))?;
        drop(out);
        temp.as_file()
            .sync_all()
            .map_err(|e| BackupError::from_write_error(e, format!("sync {key}")))?;

        let checksum = format!("{:x}", hasher.finalize());
        let artifact = Artifact::new(key, database, created_at, size_bytes, checksum, Tier::Local);

        temp.persist_noclobber(&target).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                BackupError::DuplicateKey(format!("local artifact '{key}' already exists"))
            } else {
                BackupError::from_write_error(e.error, format!("publish {key}"))
            }
        })?;

        if let Err(e) = self.write_manifest(&artifact) {
            if let Err(cleanup) = fs::remove_file(&target) {
                warn!(
                    key = %key,
                    error = %cleanup,
                    "could not remove artifact after its manifest failed to write"
                );
            }
            return Err(e);
        }

        info!(
            key = %key,
            database = %database,
            size_bytes,
            checksum = %artifact.checksum(),
            "persisted artifact"
        );
        Ok(artifact)
    }

    /// Re-read the artifact and compare against its write-time checksum.
    ///
    /// On a match the artifact becomes `Verified`, in memory and in its manifest.
    /// A mismatch returns `Ok(false)` and leaves the state unchanged.
    pub fn verify(&self, artifact: &mut Artifact) -> Result<bool> {
        let path = self.path_of(artifact.key())?;
        let (actual, size) = retry("local_verify", &self.retry, |_| {
            let file = File::open(&path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    BackupError::not_found(format!("local artifact '{}' is missing", artifact.key()))
                }
                _ => BackupError::from_write_error(e, format!("open {}", artifact.key())),
            })?;
            checksum_reader(file)
                .map_err(|e| BackupError::from_write_error(e, format!("read {}", artifact.key())))
        })?;

        if size != artifact.size_bytes() || artifact.verify_checksum(&actual).is_err() {
            warn!(
                key = %artifact.key(),
                expected = %artifact.checksum(),
                actual = %actual,
                "artifact failed verification"
            );
            return Ok(false);
        }

        artifact.set_state(ArtifactState::Verified);
        self.write_manifest(artifact)?;
        debug!(key = %artifact.key(), "artifact verified");
        Ok(true)
    }

    /// All artifacts in the store, oldest first.
    ///
    /// A data file without a readable manifest is reported as `Pending` with an empty
    /// checksum, which keeps it out of sync and retention.
    pub fn list(&self) -> Result<Vec<Artifact>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| BackupError::from_write_error(e, format!("list {}", self.root.display())))?;

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || name.ends_with(MANIFEST_SUFFIX) {
                continue;
            }
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(parsed) = ArtifactNamer::parse(&name) else {
                debug!(file = %name, "skipping foreign file in local store");
                continue;
            };

            match self.read_manifest(&name) {
                Ok(artifact) if artifact.key() == name && artifact.is_compatible() => {
                    artifacts.push(artifact)
                }
                Ok(_) | Err(_) => {
                    let size = entry.metadata()?.len();
                    warn!(key = %name, "artifact has no usable manifest, treating as pending");
                    artifacts.push(Artifact::new(
                        name.as_str(),
                        parsed.database,
                        parsed.timestamp,
                        size,
                        String::new(),
                        Tier::Local,
                    ));
                }
            }
        }
        artifacts.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.key().cmp(b.key()))
        });
        Ok(artifacts)
    }

    /// Look up one artifact by key
    pub fn get(&self, key: &str) -> Result<Artifact> {
        self.list()?
            .into_iter()
            .find(|artifact| artifact.key() == key)
            .ok_or_else(|| BackupError::not_found(format!("local artifact '{key}' not found")))
    }

    /// Delete the artifact and its manifest; `NotFound` when the key is absent.
    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        retry("local_delete", &self.retry, |_| match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackupError::not_found(format!(
                "local artifact '{key}' not found"
            ))),
            Err(e) => Err(BackupError::from_write_error(e, format!("delete {key}"))),
        })?;
        match fs::remove_file(self.manifest_path(key)?) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BackupError::from_write_error(e, format!("delete manifest of {key}"))),
        }
        info!(key = %key, "deleted local artifact");
        Ok(())
    }

    /// Retire an artifact selected by retention.
    ///
    /// The manifest is first rewritten as `Expired`, then the artifact is deleted and
    /// the record ends `Deleted`. An already-missing artifact counts as deleted. If
    /// the delete fails the manifest keeps `Expired` and the next retention pass
    /// selects the artifact again.
    pub fn retire(&self, artifact: &mut Artifact) -> Result<()> {
        artifact.set_state(ArtifactState::Expired);
        self.write_manifest(artifact)?;
        match self.delete(artifact.key()) {
            Ok(()) => {}
            Err(BackupError::NotFound(_)) => {
                debug!(key = %artifact.key(), "expired artifact already gone");
                match fs::remove_file(self.manifest_path(artifact.key())?) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(key = %artifact.key(), error = %e, "could not remove stale manifest")
                    }
                }
            }
            Err(err) => return Err(err),
        }
        artifact.set_state(ArtifactState::Deleted);
        Ok(())
    }

    /// Open an artifact's stored bytes for reading
    pub fn open_artifact(&self, key: &str) -> Result<File> {
        File::open(self.path_of(key)?).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                BackupError::not_found(format!("local artifact '{key}' not found"))
            }
            _ => BackupError::Io(e),
        })
    }

    fn write_manifest(&self, artifact: &Artifact) -> Result<()> {
        let path = self.manifest_path(artifact.key())?;
        let json = serde_json::to_vec_pretty(artifact)?;
        retry("local_write_manifest", &self.retry, |_| {
            let mut temp = NamedTempFile::new_in(&self.root)
                .map_err(|e| BackupError::from_write_error(e, "create temporary manifest"))?;
            temp.write_all(&json)
                .and_then(|_| temp.as_file().sync_all())
                .map_err(|e| BackupError::from_write_error(e, "write manifest"))?;
            temp.persist(&path)
                .map_err(|e| BackupError::from_write_error(e.error, "publish manifest"))?;
            Ok(())
        })
    }

    fn read_manifest(&self, key: &str) -> Result<Artifact> {
        let raw = fs::read(self.manifest_path(key)?)?;
        let artifact: Artifact = serde_json::from_slice(&raw)?;
        artifact.validate()?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, SourceFault};
    use backstop_retry::RetryableError;
    use chrono::TimeZone;
    use std::cell::Cell;
    use std::io::Cursor;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    fn key(h: u32) -> String {
        format!("orders_2024-05-01_{h:02}00.sql.gz")
    }

    struct BrokenSource;

    impl Read for BrokenSource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(SourceFault("connection reset by database".to_string()).into_io())
        }
    }

    /// Accepts `room` bytes, then fails every write with ENOSPC
    struct FullDisk {
        file: File,
        room: usize,
        failed_writes: Rc<Cell<usize>>,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                self.failed_writes.set(self.failed_writes.get() + 1);
                return Err(io::Error::from_raw_os_error(28));
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            self.file.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    fn non_hidden_entries(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect()
    }

    #[test]
    fn test_persist_then_verify_reproduces_checksum() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let data = b"-- dump bytes\n".repeat(10_000);

        let mut artifact = store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(data.clone()))
            .unwrap();
        assert_eq!(artifact.state(), ArtifactState::Pending);
        assert_eq!(artifact.size_bytes(), data.len() as u64);
        assert_eq!(artifact.checksum(), crate::artifact::compute_checksum(&data));

        assert!(store.verify(&mut artifact).unwrap());
        assert!(artifact.is_verified());

        // the verified state survives in the manifest
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_verified());
        assert_eq!(listed[0].checksum(), artifact.checksum());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let mut artifact = store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(b"original".to_vec()))
            .unwrap();

        fs::write(dir.path().join(key(2)), b"tampered").unwrap();
        assert!(!store.verify(&mut artifact).unwrap());
        assert_eq!(artifact.state(), ArtifactState::Pending);
    }

    #[test]
    fn test_failed_stream_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let mut input = Cursor::new(b"-- partial".to_vec()).chain(BrokenSource);
        let err = store
            .persist(&key(2), "orders", at(2), &mut input)
            .unwrap_err();

        assert!(matches!(err, BackupError::Source(_)));
        assert!(store.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_existing_key_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(b"first".to_vec()))
            .unwrap();

        let err = store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(b"second".to_vec()))
            .unwrap_err();
        assert!(matches!(err, BackupError::DuplicateKey(_)));
        assert_eq!(fs::read(dir.path().join(key(2))).unwrap(), b"first");
    }

    #[test]
    fn test_list_orders_and_skips_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        for h in [5, 1, 3] {
            store
                .persist(&key(h), "orders", at(h), &mut Cursor::new(vec![h as u8]))
                .unwrap();
        }
        fs::write(dir.path().join("README.txt"), b"not a backup").unwrap();
        fs::write(dir.path().join(".tmpXYZ"), b"stale temp").unwrap();

        let keys: Vec<String> = store.list().unwrap().iter().map(|a| a.key().to_string()).collect();
        assert_eq!(keys, vec![key(1), key(3), key(5)]);
    }

    #[test]
    fn test_file_without_manifest_is_pending() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(key(4)), b"copied in by hand").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state(), ArtifactState::Pending);
        assert_eq!(listed[0].database(), "orders");
        assert_eq!(listed[0].created_at(), at(4));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(b"x".to_vec()))
            .unwrap();

        store.delete(&key(2)).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(!dir.path().join(format!("{}{MANIFEST_SUFFIX}", key(2))).exists());
        assert!(matches!(store.delete(&key(2)), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn test_disk_full_mid_stream_fails_once_and_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let data = b"INSERT INTO orders VALUES (1);\n".repeat(8_000);
        let failed_writes = Rc::new(Cell::new(0));

        let counter = Rc::clone(&failed_writes);
        let err = store
            .persist_with(&key(2), "orders", at(2), &mut Cursor::new(data.clone()), |file| {
                FullDisk { file, room: 4096, failed_writes: counter }
            })
            .unwrap_err();

        assert!(matches!(err, BackupError::DiskFull(_)));
        assert_eq!(err.kind(), ErrorKind::DiskFull);
        assert!(!err.is_transient());
        assert_eq!(failed_writes.get(), 1);
        assert!(store.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        // the key is still free once space is back
        let artifact = store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(data.clone()))
            .unwrap();
        assert_eq!(artifact.size_bytes(), data.len() as u64);
    }

    #[test]
    fn test_manifest_failure_removes_published_artifact() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        // a directory squatting on the manifest path makes the manifest rename fail
        fs::create_dir(dir.path().join(format!("{}{MANIFEST_SUFFIX}", key(2)))).unwrap();

        let err = store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(b"dump".to_vec()))
            .unwrap_err();

        assert!(matches!(err, BackupError::Write { .. }));
        assert!(!dir.path().join(key(2)).exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_manifest_is_treated_as_pending() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let mut artifact = store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(b"dump".to_vec()))
            .unwrap();
        assert!(store.verify(&mut artifact).unwrap());

        let manifest = dir.path().join(format!("{}{MANIFEST_SUFFIX}", key(2)));
        let edited = fs::read_to_string(&manifest)
            .unwrap()
            .replace(artifact.checksum(), "not-a-digest");
        fs::write(&manifest, edited).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state(), ArtifactState::Pending);
        assert!(listed[0].checksum().is_empty());
    }

    #[test]
    fn test_retire_moves_through_expired_to_deleted() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let mut artifact = store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(b"dump".to_vec()))
            .unwrap();
        assert!(store.verify(&mut artifact).unwrap());

        store.retire(&mut artifact).unwrap();
        assert_eq!(artifact.state(), ArtifactState::Deleted);
        assert!(store.list().unwrap().is_empty());
        assert!(non_hidden_entries(dir.path()).is_empty());

        // retiring again is not an error
        let mut again = artifact.clone();
        store.retire(&mut again).unwrap();
        assert_eq!(again.state(), ArtifactState::Deleted);
        assert!(non_hidden_entries(dir.path()).is_empty());
    }

    #[test]
    fn test_expired_manifest_survives_listing() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let mut artifact = store
            .persist(&key(2), "orders", at(2), &mut Cursor::new(b"dump".to_vec()))
            .unwrap();
        assert!(store.verify(&mut artifact).unwrap());

        // a retire that stopped after recording the expiry
        artifact.set_state(ArtifactState::Expired);
        store.write_manifest(&artifact).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state(), ArtifactState::Expired);
        assert!(!listed[0].is_verified());
    }
}
