//! Configuration for a Backstop deployment
//!
//! [`BackstopConfig`] is an immutable value handed to the orchestrator at
//! construction. It is usually loaded from a JSON file; every section has defaults so
//! a file only needs to name what differs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use backstop_retry::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::naming::ArtifactNamer;
use crate::retention::{RetentionConfig, RetentionWindow};
use crate::source::CommandSourceConfig;
use crate::storage::{DirectoryObjectStorage, MemoryObjectStorage, ObjectStorage};
use crate::transform::{CompressionOption, EncryptionOption, TransformOptions};
use crate::{BackupError, Result};

const MAX_LOCK_LEASE_SECS: u64 = 7 * 24 * 60 * 60;

/// Local tier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding artifacts, manifests and run locks
    pub root: PathBuf,
    /// Lifetime of a run lock; a crashed run's lock can be taken over after this
    pub lock_lease_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/backstop"),
            lock_lease_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub granularity_minutes: u32,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            granularity_minutes: 1,
        }
    }
}

/// S3 bucket location of a remote tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Target {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores; implies path-style addressing
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Storage behind a remote tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteBackend {
    /// A mounted directory, e.g. an NFS or SMB share
    Directory { path: PathBuf },
    S3(S3Target),
    /// Process-local store; contents vanish with the process
    Memory,
}

/// One named remote tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub name: String,
    pub backend: RemoteBackend,
}

impl RemoteConfig {
    /// Parse a storage URI into a remote tier definition
    ///
    /// Supports formats:
    /// - `s3://bucket-name/prefix` for S3 storage
    /// - `memory://` for an in-process store
    /// - `/mnt/share/backups` or `./relative/path` for a directory mirror
    pub fn from_uri(name: &str, uri: &str) -> Result<Self> {
        let backend = if let Some(s3_part) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = s3_part.split_once('/').unwrap_or((s3_part, ""));
            if bucket.is_empty() {
                return Err(BackupError::validation("Invalid S3 URI: missing bucket name"));
            }
            RemoteBackend::S3(S3Target {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
                region: None,
                endpoint: None,
            })
        } else if uri == "memory://" {
            RemoteBackend::Memory
        } else if uri.is_empty() || uri.contains("://") {
            return Err(BackupError::validation(format!(
                "unsupported storage URI '{uri}'"
            )));
        } else {
            RemoteBackend::Directory {
                path: PathBuf::from(uri),
            }
        };
        Ok(Self {
            name: name.to_string(),
            backend,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(BackupError::validation(format!(
                "remote name '{}' must be non-empty and use only letters, digits, '-' or '_'",
                self.name
            )));
        }
        match &self.backend {
            RemoteBackend::Directory { path } if path.as_os_str().is_empty() => Err(
                BackupError::validation(format!("remote '{}' has an empty directory path", self.name)),
            ),
            RemoteBackend::S3(target) if target.bucket.is_empty() => Err(BackupError::validation(
                format!("remote '{}': S3 backend requires a valid bucket name", self.name),
            )),
            _ => Ok(()),
        }
    }

    /// Instantiate the storage adapter for this tier.
    ///
    /// Adapters make single attempts bounded by `operation_timeout`; retries belong
    /// to the [`RemoteStore`](crate::remote::RemoteStore) wrapping them.
    pub fn build(&self, operation_timeout: Duration) -> Result<Arc<dyn ObjectStorage>> {
        self.validate()?;
        match &self.backend {
            RemoteBackend::Directory { path } => {
                Ok(Arc::new(
                    DirectoryObjectStorage::new(self.name.as_str(), path)
                        .with_operation_timeout(operation_timeout),
                ))
            }
            RemoteBackend::Memory => Ok(Arc::new(MemoryObjectStorage::new(self.name.as_str()))),
            #[cfg(feature = "s3")]
            RemoteBackend::S3(target) => {
                use crate::storage::{block_on, BlockingObjectStorage, S3ObjectStorage};
                let adapter = block_on(S3ObjectStorage::connect(
                    &self.name,
                    target,
                    operation_timeout,
                ))?;
                Ok(Arc::new(BlockingObjectStorage::new(adapter)))
            }
            #[cfg(not(feature = "s3"))]
            RemoteBackend::S3(_) => Err(BackupError::validation(format!(
                "remote '{}' uses S3 but this build does not include the s3 feature",
                self.name
            ))),
        }
    }
}

/// Complete deployment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackstopConfig {
    pub local: LocalConfig,
    pub naming: NamingConfig,
    pub transform: TransformOptions,
    pub retention: RetentionConfig,
    pub remotes: Vec<RemoteConfig>,
    pub source: CommandSourceConfig,
    /// Upper bound on snapshot streaming; `None` waits indefinitely
    pub snapshot_timeout_secs: Option<u64>,
    /// Upper bound on a single remote request
    pub operation_timeout_secs: u64,
    /// Propagate retention to remote tiers
    pub auto_prune: bool,
    pub retry: RetryPolicy,
}

impl Default for BackstopConfig {
    fn default() -> Self {
        Self {
            local: LocalConfig::default(),
            naming: NamingConfig::default(),
            transform: TransformOptions::default(),
            retention: RetentionConfig::default(),
            remotes: Vec::new(),
            source: CommandSourceConfig::default(),
            snapshot_timeout_secs: Some(4 * 60 * 60),
            operation_timeout_secs: 300,
            auto_prune: false,
            retry: RetryPolicy::cloud_storage(),
        }
    }
}

impl BackstopConfig {
    /// Read and validate a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| {
            BackupError::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.local.root.as_os_str().is_empty() {
            return Err(BackupError::validation("local.root cannot be empty"));
        }
        if self.local.lock_lease_secs == 0 || self.local.lock_lease_secs > MAX_LOCK_LEASE_SECS {
            return Err(BackupError::validation(format!(
                "local.lock_lease_secs must be between 1 and {MAX_LOCK_LEASE_SECS}"
            )));
        }
        ArtifactNamer::new(self.naming.granularity_minutes, "sql")?;
        self.retention_window()?;

        if let CompressionOption::Gzip { level } = self.transform.compression {
            if level > 9 {
                return Err(BackupError::validation(format!(
                    "gzip level must be between 0 and 9 (got {level})"
                )));
            }
        }
        if let EncryptionOption::Passphrase { credential } = &self.transform.encryption {
            if credential.as_str().is_empty() {
                return Err(BackupError::validation("encryption passphrase handle is empty"));
            }
        }

        let mut names = HashSet::new();
        for remote in &self.remotes {
            remote.validate()?;
            if !names.insert(remote.name.as_str()) {
                return Err(BackupError::validation(format!(
                    "remote '{}' is defined more than once",
                    remote.name
                )));
            }
        }

        if self.source.program.is_empty() {
            return Err(BackupError::validation("source.program cannot be empty"));
        }
        if self.snapshot_timeout_secs == Some(0) {
            return Err(BackupError::validation("snapshot_timeout_secs must be positive"));
        }
        if self.operation_timeout_secs == 0 {
            return Err(BackupError::validation("operation_timeout_secs must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(BackupError::validation("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn retention_window(&self) -> Result<RetentionWindow> {
        self.retention.window()
    }

    pub fn lock_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.local.lock_lease_secs.min(MAX_LOCK_LEASE_SECS) as i64)
    }

    pub fn snapshot_timeout(&self) -> Option<Duration> {
        self.snapshot_timeout_secs.map(Duration::from_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn remote(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes.iter().find(|r| r.name == name)
    }

    pub fn remote_names(&self) -> Vec<String> {
        self.remotes.iter().map(|r| r.name.clone()).collect()
    }
}
