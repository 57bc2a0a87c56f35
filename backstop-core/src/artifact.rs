/*!
Artifact records and integrity helpers.

An [`Artifact`] is one immutable backup object in one storage tier. Its key and
checksum are fixed at creation; only the owning store changes its [`ArtifactState`].
*/

use std::io::{self, Read};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{BackupError, Result};

/// Current manifest format version for compatibility tracking
pub const MANIFEST_FORMAT_VERSION: u8 = 1;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Storage location class
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Local,
    Remote,
}

/// Lifecycle state of an artifact within its tier
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    /// Written but not yet read back and checked
    Pending,
    /// Checksum confirmed after a full read-back
    Verified,
    /// Selected by retention, deletion not yet confirmed
    Expired,
    /// Removed from the tier
    Deleted,
}

/// One immutable unit of backup output
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Artifact {
    key: String,
    database: String,
    size_bytes: u64,
    /// SHA-256 over the final stored bytes, lowercase hex
    checksum: String,
    created_at: DateTime<Utc>,
    tier: Tier,
    state: ArtifactState,
    format_version: u8,
}

impl Artifact {
    /// Create a pending artifact record.
    pub fn new<K, D, C>(
        key: K,
        database: D,
        created_at: DateTime<Utc>,
        size_bytes: u64,
        checksum: C,
        tier: Tier,
    ) -> Self
    where
        K: Into<String>,
        D: Into<String>,
        C: Into<String>,
    {
        Self {
            key: key.into(),
            database: database.into(),
            size_bytes,
            checksum: checksum.into(),
            created_at,
            tier,
            state: ArtifactState::Pending,
            format_version: MANIFEST_FORMAT_VERSION,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn state(&self) -> ArtifactState {
        self.state
    }

    pub fn format_version(&self) -> u8 {
        self.format_version
    }

    pub fn is_verified(&self) -> bool {
        self.state == ArtifactState::Verified
    }

    /// Only the store owning this artifact's tier calls this.
    pub(crate) fn set_state(&mut self, state: ArtifactState) {
        self.state = state;
    }

    /// Check if this record is compatible with the current manifest format
    pub fn is_compatible(&self) -> bool {
        self.format_version <= MANIFEST_FORMAT_VERSION
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(BackupError::validation("artifact key cannot be empty"));
        }
        if self.database.is_empty() {
            return Err(BackupError::validation("artifact database cannot be empty"));
        }
        if self.checksum.len() != 64 || !self.checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BackupError::validation(format!(
                "artifact {} carries a malformed checksum",
                self.key
            )));
        }
        Ok(())
    }

    /// Compare a freshly computed checksum with the recorded one
    pub fn verify_checksum(&self, actual: &str) -> Result<()> {
        if actual == self.checksum {
            Ok(())
        } else {
            Err(BackupError::IntegrityCheckFailed {
                key: self.key.clone(),
                expected: self.checksum.clone(),
                actual: actual.to_string(),
            })
        }
    }
}

/// Compute SHA-256 hash of the provided data
///
/// # Returns
/// Hexadecimal string representation of the SHA-256 hash
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Stream a reader through SHA-256, returning the digest and byte count
pub fn checksum_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}
