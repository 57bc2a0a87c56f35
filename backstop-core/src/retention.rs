/*!
Retention policy.

[`expired`] is a pure function over a snapshot of one tier's inventory. Local and
remote tiers are evaluated separately and may legitimately disagree while a remote
sync lags behind.
*/

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactState};
use crate::{BackupError, Result};

/// Maximum age plus a floor of artifacts that always survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    duration: Duration,
    minimum_keep: usize,
}

impl RetentionWindow {
    pub fn new(duration: Duration, minimum_keep: usize) -> Result<Self> {
        if duration < Duration::zero() {
            return Err(BackupError::policy(format!(
                "retention window cannot be negative (got {} seconds)",
                duration.num_seconds()
            )));
        }
        Ok(Self {
            duration,
            minimum_keep,
        })
    }

    pub fn days(days: i64, minimum_keep: usize) -> Result<Self> {
        let duration = Duration::try_days(days)
            .ok_or_else(|| BackupError::policy(format!("retention of {days} days is out of range")))?;
        Self::new(duration, minimum_keep)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn minimum_keep(&self) -> usize {
        self.minimum_keep
    }
}

/// Serializable form used in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub days: i64,
    pub minimum_keep: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            minimum_keep: 3,
        }
    }
}

impl RetentionConfig {
    pub fn window(&self) -> Result<RetentionWindow> {
        RetentionWindow::days(self.days, self.minimum_keep)
    }
}

/// Newest first; on equal timestamps the lexicographically higher key is newer.
fn newest_first(a: &&Artifact, b: &&Artifact) -> Ordering {
    b.created_at()
        .cmp(&a.created_at())
        .then_with(|| b.key().cmp(a.key()))
}

/// Keys of artifacts that fall outside `window` at `now`.
///
/// Only verified artifacts are weighed: a pending artifact neither counts towards
/// the floor nor is ever selected. The newest `minimum_keep` verified artifacts are
/// kept regardless of age; of the rest, anything older than the window expires.
/// Artifacts already marked `Expired` by an unfinished prune are selected again.
pub fn expired(
    inventory: &[Artifact],
    window: &RetentionWindow,
    now: DateTime<Utc>,
) -> BTreeSet<String> {
    let mut candidates: Vec<&Artifact> = inventory.iter().filter(|a| a.is_verified()).collect();
    candidates.sort_by(newest_first);

    let leftover = inventory
        .iter()
        .filter(|a| a.state() == ArtifactState::Expired);
    candidates
        .into_iter()
        .skip(window.minimum_keep)
        .filter(|artifact| now - artifact.created_at() > window.duration)
        .chain(leftover)
        .map(|artifact| artifact.key().to_string())
        .collect()
}
