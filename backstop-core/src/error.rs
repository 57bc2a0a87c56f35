/*!
Error types for the Backstop core engine.
*/

use std::fmt;
use std::io;

use backstop_retry::RetryableError;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::remote::SyncReport;

/// Result type used throughout the Backstop core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur during a backup run.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Snapshot unreadable, truncated, or timed out
    #[error("Source error: {0}")]
    Source(String),

    /// Compression or encryption stream failure
    #[error("Transform error: {0}")]
    Transform(String),

    /// Local persistence failure; `transient` marks errors worth retrying
    #[error("Write error: {message}")]
    Write { message: String, transient: bool },

    /// Local disk has no space left
    #[error("Disk full: {0}")]
    DiskFull(String),

    /// Remote tier unreachable or timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Remote tier rejected the credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Remote sync applied only partially; the report names every key
    #[error("Partial sync to '{}': {} uploaded, {} failed", .0.tier, .0.uploaded.len(), .0.failed.len())]
    PartialSync(Box<SyncReport>),

    /// Two runs of the same database within one naming window
    #[error("Duplicate artifact key: {0}")]
    DuplicateKey(String),

    /// Invalid retention or naming configuration
    #[error("Policy error: {0}")]
    Policy(String),

    /// Artifact or object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Checksum recomputed on read-back differs from the write-time checksum
    #[error("Integrity check failed for {key}: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed {
        key: String,
        expected: String,
        actual: String,
    },

    /// Another run holds the lease for this database
    #[error("Run lock for database '{database}' is held by run {holder} until {expires_at}")]
    LockContention {
        database: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// I/O errors outside the streaming pipeline
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl BackupError {
    pub fn source_error<S: Into<String>>(msg: S) -> Self {
        Self::Source(msg.into())
    }

    pub fn transform<S: Into<String>>(msg: S) -> Self {
        Self::Transform(msg.into())
    }

    pub fn write<S: Into<String>>(msg: S) -> Self {
        Self::Write {
            message: msg.into(),
            transient: false,
        }
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    pub fn policy<S: Into<String>>(msg: S) -> Self {
        Self::Policy(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Classify an error raised while writing to local disk.
    pub fn from_write_error(err: io::Error, context: impl fmt::Display) -> Self {
        if is_disk_full(&err) {
            return Self::DiskFull(format!("{context}: {err}"));
        }
        let transient = matches!(
            err.kind(),
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        );
        Self::Write {
            message: format!("{context}: {err}"),
            transient,
        }
    }

    /// Classify an error raised while pulling bytes through the transform pipeline.
    ///
    /// Failures that originate in the snapshot source keep their identity through
    /// the compression and encryption layers via [`SourceFault`].
    pub fn from_stream_error(err: io::Error) -> Self {
        match err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<SourceFault>())
        {
            Some(fault) => Self::Source(fault.0.clone()),
            None => Self::Transform(err.to_string()),
        }
    }

    /// Stable kind used in step results and failure notifications.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Source(_) => ErrorKind::Source,
            Self::Transform(_) => ErrorKind::Transform,
            Self::Write { .. } => ErrorKind::Write,
            Self::DiskFull(_) => ErrorKind::DiskFull,
            Self::Network(_) => ErrorKind::Network,
            Self::Auth(_) => ErrorKind::Auth,
            Self::PartialSync(_) => ErrorKind::PartialSync,
            Self::DuplicateKey(_) => ErrorKind::DuplicateKey,
            Self::Policy(_) => ErrorKind::Policy,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::IntegrityCheckFailed { .. } => ErrorKind::Integrity,
            Self::LockContention { .. } => ErrorKind::LockContention,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Serialization,
            Self::Validation(_) => ErrorKind::Validation,
        }
    }
}

impl RetryableError for BackupError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Write { transient, .. } => *transient,
            _ => false,
        }
    }
}

fn is_disk_full(err: &io::Error) -> bool {
    // ENOSPC is 28 on Linux and the BSDs
    err.kind() == io::ErrorKind::StorageFull || err.raw_os_error() == Some(28)
}

/// Marker carried inside an `io::Error` when the snapshot source itself failed.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct SourceFault(pub String);

impl SourceFault {
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }
}

/// Error classes surfaced to step results and alert sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Source,
    Transform,
    Write,
    DiskFull,
    Network,
    Auth,
    PartialSync,
    DuplicateKey,
    Policy,
    NotFound,
    Integrity,
    LockContention,
    Io,
    Serialization,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "SourceError",
            Self::Transform => "TransformError",
            Self::Write => "WriteError",
            Self::DiskFull => "DiskFullError",
            Self::Network => "NetworkError",
            Self::Auth => "AuthError",
            Self::PartialSync => "PartialSyncError",
            Self::DuplicateKey => "DuplicateKeyError",
            Self::Policy => "PolicyError",
            Self::NotFound => "NotFoundError",
            Self::Integrity => "IntegrityError",
            Self::LockContention => "LockContentionError",
            Self::Io => "IoError",
            Self::Serialization => "SerializationError",
            Self::Validation => "ValidationError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
