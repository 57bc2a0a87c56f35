//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use backstop_core::error::SourceFault;
use backstop_core::storage::RemoteObject;
use backstop_core::transform::{ByteStream, CompressionOption, EncryptionOption, TransformOptions};
use backstop_core::{
    BackstopConfig, BackupError, BackupOrchestrator, ConsistencyMode, CredentialHandle,
    ManualClock, MemoryObjectStorage, ObjectStorage, RemoteStore, Result, RetentionWindow,
    SnapshotSource, StaticCredentialProvider, Trigger,
};
use backstop_retry::RetryPolicy;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const DATABASE: &str = "orders";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap()
}

pub fn dump_bytes(rows: usize) -> Vec<u8> {
    let mut dump = b"-- MySQL dump\nCREATE TABLE orders (id INT, item VARCHAR(64));\n".to_vec();
    for i in 0..rows {
        dump.extend_from_slice(format!("INSERT INTO orders VALUES ({i}, 'widget-{i}');\n").as_bytes());
    }
    dump.extend_from_slice(b"-- Dump completed\n");
    dump
}

/// Returns the same dump on every call
pub struct FixedSource {
    pub data: Vec<u8>,
    pub calls: AtomicUsize,
}

impl FixedSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            calls: AtomicUsize::new(0),
        }
    }
}

impl SnapshotSource for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    fn take_snapshot(&self, _: &str, _: ConsistencyMode, _: &CancellationToken) -> Result<ByteStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

/// Streams `good_bytes` of a dump and then fails like a killed dump process
pub struct DyingSource {
    pub good_bytes: usize,
}

impl SnapshotSource for DyingSource {
    fn name(&self) -> &str {
        "dying"
    }

    fn take_snapshot(&self, _: &str, _: ConsistencyMode, _: &CancellationToken) -> Result<ByteStream> {
        let head = dump_bytes(10_000)[..self.good_bytes].to_vec();
        Ok(Box::new(DyingReader(Cursor::new(head))))
    }
}

struct DyingReader(Cursor<Vec<u8>>);

impl Read for DyingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf)? {
            0 => Err(SourceFault("mysqldump exited with status 2: Lost connection".to_string()).into_io()),
            n => Ok(n),
        }
    }
}

/// Blocks its stream until released, so tests can act while a run is mid-snapshot
pub struct GatedSource {
    started: Mutex<Sender<()>>,
    release: Arc<Mutex<Receiver<()>>>,
}

pub struct Gate {
    pub started: Receiver<()>,
    pub release: Sender<()>,
}

impl GatedSource {
    pub fn new() -> (Self, Gate) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            Self {
                started: Mutex::new(started_tx),
                release: Arc::new(Mutex::new(release_rx)),
            },
            Gate {
                started: started_rx,
                release: release_tx,
            },
        )
    }
}

impl SnapshotSource for GatedSource {
    fn name(&self) -> &str {
        "gated"
    }

    fn take_snapshot(&self, _: &str, _: ConsistencyMode, _: &CancellationToken) -> Result<ByteStream> {
        let _ = self.started.lock().unwrap().send(());
        Ok(Box::new(GatedReader {
            release: Arc::clone(&self.release),
            released: false,
            data: Cursor::new(dump_bytes(100)),
        }))
    }
}

struct GatedReader {
    release: Arc<Mutex<Receiver<()>>>,
    released: bool,
    data: Cursor<Vec<u8>>,
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.released {
            let _ = self.release.lock().unwrap().recv();
            self.released = true;
        }
        self.data.read(buf)
    }
}

/// Memory tier that fails selected uploads with a network error
pub struct FlakyStorage {
    pub inner: MemoryObjectStorage,
    uploads: AtomicUsize,
    fail_on_upload: Mutex<Option<usize>>,
    reject_credentials: Mutex<bool>,
}

impl FlakyStorage {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryObjectStorage::new(name),
            uploads: AtomicUsize::new(0),
            fail_on_upload: Mutex::new(None),
            reject_credentials: Mutex::new(false),
        }
    }

    /// Fail the `n`th upload from now on (1-based)
    pub fn fail_upload_number(&self, n: usize) {
        self.uploads.store(0, Ordering::SeqCst);
        *self.fail_on_upload.lock().unwrap() = Some(n);
    }

    pub fn heal(&self) {
        *self.fail_on_upload.lock().unwrap() = None;
        *self.reject_credentials.lock().unwrap() = false;
    }

    pub fn reject_credentials(&self) {
        *self.reject_credentials.lock().unwrap() = true;
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

impl ObjectStorage for FlakyStorage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        self.inner.list(prefix)
    }

    fn upload(&self, key: &str, source: &Path, checksum: &str) -> Result<()> {
        if *self.reject_credentials.lock().unwrap() {
            return Err(BackupError::auth("403 Forbidden: invalid access key"));
        }
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on_upload.lock().unwrap() == Some(n) {
            return Err(BackupError::network(format!("connection reset while uploading {key}")));
        }
        self.inner.upload(key, source, checksum)
    }

    fn delete(&self, key: &str) -> Result<()> {
        if *self.reject_credentials.lock().unwrap() {
            return Err(BackupError::auth("403 Forbidden: invalid access key"));
        }
        self.inner.delete(key)
    }
}

pub fn remote(storage: Arc<dyn ObjectStorage>) -> RemoteStore {
    RemoteStore::new(storage).with_retry_policy(RetryPolicy::none())
}

pub fn gzip_config(dir: &TempDir) -> BackstopConfig {
    let mut config = BackstopConfig::default();
    config.local.root = dir.path().join("local");
    config.retry = RetryPolicy::none();
    config
}

pub fn encrypted_config(dir: &TempDir) -> (BackstopConfig, StaticCredentialProvider) {
    let handle = CredentialHandle::new("env:BACKSTOP_TEST_PASSPHRASE");
    let mut config = gzip_config(dir);
    config.transform = TransformOptions {
        compression: CompressionOption::Gzip { level: 6 },
        encryption: EncryptionOption::Passphrase {
            credential: handle.clone(),
        },
    };
    (config, StaticCredentialProvider::new().with(handle, "correct horse battery staple"))
}

pub fn build(
    config: BackstopConfig,
    source: Arc<dyn SnapshotSource>,
    remotes: Vec<RemoteStore>,
    credentials: &StaticCredentialProvider,
) -> (BackupOrchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let orchestrator = BackupOrchestrator::new(config, source, remotes, credentials)
        .unwrap()
        .with_clock(clock.clone());
    (orchestrator, clock)
}

pub fn trigger(days: i64, minimum_keep: usize, targets: &[&str]) -> Trigger {
    Trigger::new(
        DATABASE,
        ConsistencyMode::SingleTransaction,
        RetentionWindow::days(days, minimum_keep).unwrap(),
        targets.iter().map(|t| t.to_string()).collect(),
    )
}
