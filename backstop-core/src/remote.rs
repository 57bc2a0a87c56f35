/*!
Remote tiers: mirroring and remote retention.

[`RemoteStore::sync`] is an idempotent mirror of the verified local inventory: it
uploads what is missing or checksum-mismatched remotely and reports every key it
touched. Deletion is a separate step, [`RemoteStore::prune`], which the orchestrator
only invokes for a tier once that tier has confirmed the newest local artifact.
*/

use std::collections::HashMap;
use std::sync::Arc;

use backstop_retry::{retry, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactState, Tier};
use crate::error::ErrorKind;
use crate::local_store::LocalStore;
use crate::naming::ArtifactNamer;
use crate::retention::{self, RetentionWindow};
use crate::storage::{ObjectStorage, RemoteObject};
use crate::{BackupError, Result};

/// One key that a remote operation could not apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyFailure {
    pub key: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl KeyFailure {
    fn new(key: &str, err: &BackupError) -> Self {
        Self {
            key: key.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one sync against one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub tier: String,
    /// Keys uploaded by this call
    pub uploaded: Vec<String>,
    /// Keys that could not be uploaded
    pub failed: Vec<KeyFailure>,
    /// Keys already present remotely with a matching checksum
    pub in_sync: Vec<String>,
    /// Local artifacts ignored because they are not verified
    pub skipped_unverified: usize,
    /// Upload attempts beyond the first
    pub retries: usize,
}

impl SyncReport {
    fn new(tier: &str) -> Self {
        Self {
            tier: tier.to_string(),
            uploaded: Vec::new(),
            failed: Vec::new(),
            in_sync: Vec::new(),
            skipped_unverified: 0,
            retries: 0,
        }
    }

    /// True when the call changed nothing and nothing failed
    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty() && self.failed.is_empty()
    }

    /// Whether `key` is known to be present and intact on this tier
    pub fn confirms(&self, key: &str) -> bool {
        self.uploaded.iter().any(|k| k == key) || self.in_sync.iter().any(|k| k == key)
    }
}

/// Outcome of remote retention against one tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub tier: String,
    pub deleted: Vec<String>,
    pub failed: Vec<KeyFailure>,
}

/// One off-site tier; sole mutator of artifact state on that tier
#[derive(Clone)]
pub struct RemoteStore {
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
}

impl RemoteStore {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            storage,
            retry: RetryPolicy::cloud_storage(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        self.storage.name()
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        retry("remote_list", &self.retry, |_| self.storage.list(prefix))
    }

    /// Remote artifacts of `database`, or of every database when `None`.
    ///
    /// Objects with a recorded checksum are `Verified`; anything else is `Pending` and
    /// therefore invisible to retention. Objects whose key does not parse are skipped.
    pub fn inventory(&self, database: Option<&str>) -> Result<Vec<Artifact>> {
        let prefix = database.map(|db| format!("{db}_")).unwrap_or_default();
        let mut artifacts: Vec<Artifact> = self
            .list_objects(&prefix)?
            .into_iter()
            .filter_map(|object| {
                let parsed = ArtifactNamer::parse(&object.key)?;
                if database.is_some_and(|db| db != parsed.database) {
                    return None;
                }
                let verified = object.checksum.is_some();
                let mut artifact = Artifact::new(
                    object.key,
                    parsed.database,
                    parsed.timestamp,
                    object.size_bytes,
                    object.checksum.unwrap_or_default(),
                    Tier::Remote,
                );
                if verified {
                    artifact.set_state(ArtifactState::Verified);
                }
                Some(artifact)
            })
            .collect();
        artifacts.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.key().cmp(b.key())));
        Ok(artifacts)
    }

    /// Mirror verified local artifacts onto this tier.
    ///
    /// Uploads newest first. A rejected credential stops the pass and marks every
    /// remaining key failed; any other per-key failure is recorded and the pass
    /// continues. If any key failed the report is returned inside `PartialSync`;
    /// keys uploaded before the failure stay uploaded.
    pub fn sync(&self, local: &LocalStore, inventory: &[Artifact]) -> Result<SyncReport> {
        let tier = self.name().to_string();
        let remote: HashMap<String, Option<String>> = self
            .list_objects("")?
            .into_iter()
            .map(|object| (object.key, object.checksum))
            .collect();

        let mut report = SyncReport::new(&tier);
        let mut candidates: Vec<&Artifact> = Vec::new();
        for artifact in inventory.iter().filter(|a| a.tier() == Tier::Local) {
            if artifact.is_verified() {
                candidates.push(artifact);
            } else {
                debug!(tier = %tier, key = %artifact.key(), "skipping unverified artifact");
                report.skipped_unverified += 1;
            }
        }
        candidates.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.key().cmp(a.key()))
        });

        let mut remaining = candidates.into_iter();
        while let Some(artifact) = remaining.next() {
            let key = artifact.key();
            if remote.get(key).and_then(|c| c.as_deref()) == Some(artifact.checksum()) {
                report.in_sync.push(key.to_string());
                continue;
            }

            let result = local.path_of(key).and_then(|path| {
                retry("remote_upload", &self.retry, |attempt| {
                    if attempt > 1 {
                        report.retries += 1;
                    }
                    self.storage.upload(key, &path, artifact.checksum())
                })
            });
            match result {
                Ok(()) => {
                    info!(tier = %tier, key = %key, size_bytes = artifact.size_bytes(), "uploaded artifact");
                    report.uploaded.push(key.to_string());
                }
                Err(err @ BackupError::Auth(_)) => {
                    warn!(tier = %tier, key = %key, error = %err, "credentials rejected, stopping sync");
                    report.failed.push(KeyFailure::new(key, &err));
                    for skipped in remaining.by_ref() {
                        report.failed.push(KeyFailure::new(skipped.key(), &err));
                    }
                }
                Err(err) => {
                    warn!(tier = %tier, key = %key, error = %err, "upload failed");
                    report.failed.push(KeyFailure::new(key, &err));
                }
            }
        }

        if report.failed.is_empty() {
            debug!(
                tier = %tier,
                uploaded = report.uploaded.len(),
                in_sync = report.in_sync.len(),
                "sync complete"
            );
            Ok(report)
        } else {
            Err(BackupError::PartialSync(Box::new(report)))
        }
    }

    /// Apply retention to this tier's artifacts of `database`.
    ///
    /// Deleting a key that is already gone counts as success. Per-key failures are
    /// reported, not raised; only a failed listing is an error.
    pub fn prune(
        &self,
        database: &str,
        window: &RetentionWindow,
        now: DateTime<Utc>,
    ) -> Result<PruneReport> {
        let inventory = self.inventory(Some(database))?;
        let expired = retention::expired(&inventory, window, now);
        let mut report = PruneReport {
            tier: self.name().to_string(),
            ..PruneReport::default()
        };

        let mut remaining = expired.iter();
        while let Some(key) = remaining.next() {
            match retry("remote_delete", &self.retry, |_| self.storage.delete(key)) {
                Ok(()) | Err(BackupError::NotFound(_)) => {
                    info!(tier = %report.tier, key = %key, "pruned remote artifact");
                    report.deleted.push(key.clone());
                }
                Err(err @ BackupError::Auth(_)) => {
                    report.failed.push(KeyFailure::new(key, &err));
                    for skipped in remaining.by_ref() {
                        report.failed.push(KeyFailure::new(skipped, &err));
                    }
                }
                Err(err) => {
                    warn!(tier = %report.tier, key = %key, error = %err, "remote delete failed");
                    report.failed.push(KeyFailure::new(key, &err));
                }
            }
        }
        Ok(report)
    }
}
