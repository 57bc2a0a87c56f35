/*!
Per-database run lock.

The lock is a lease file `.<database>.lock` in the local store root, created with
`O_EXCL` semantics. It records the holding run and an expiry; a lease past its
expiry is considered abandoned by a crashed run and may be taken over.
*/

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{BackupError, Result};

const TAKEOVER_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    run_id: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Exclusive lease on one database; released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    database: String,
    run_id: String,
    expires_at: DateTime<Utc>,
    held: bool,
}

impl RunLock {
    /// Path of the lease file for `database` under `dir`
    pub fn path_for(dir: &Path, database: &str) -> PathBuf {
        dir.join(format!(".{database}.lock"))
    }

    /// Take the lease or fail fast with `LockContention`.
    pub fn acquire(
        dir: &Path,
        database: &str,
        run_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let path = Self::path_for(dir, database);
        let record = LeaseRecord {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + lease,
        };

        for _ in 0..TAKEOVER_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let json = serde_json::to_vec(&record)?;
                    file.write_all(&json)
                        .and_then(|_| file.sync_all())
                        .map_err(|e| {
                            let _ = fs::remove_file(&path);
                            BackupError::from_write_error(e, "write run lock")
                        })?;
                    info!(database = %database, run_id = %run_id, expires_at = %record.expires_at, "acquired run lock");
                    return Ok(Self {
                        path,
                        database: database.to_string(),
                        run_id: run_id.to_string(),
                        expires_at: record.expires_at,
                        held: true,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    Self::take_over_if_stale(&path, database, run_id, lease, now)?;
                }
                Err(e) => return Err(BackupError::from_write_error(e, "create run lock")),
            }
        }
        Err(BackupError::LockContention {
            database: database.to_string(),
            holder: "unknown".to_string(),
            expires_at: now + lease,
        })
    }

    /// Returns `Ok` when the existing lease is gone or was cleared, so the caller can
    /// retry creating it.
    fn take_over_if_stale(
        path: &Path,
        database: &str,
        run_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = match read_lease(path, lease) {
            Ok(current) => current,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BackupError::Io(e)),
        };
        if current.expires_at > now {
            return Err(BackupError::LockContention {
                database: database.to_string(),
                holder: current.run_id,
                expires_at: current.expires_at,
            });
        }

        // move the stale lease aside under a name only this run uses, then make sure
        // what was moved is still the stale lease and not a fresh one from a racing run
        let aside = path.with_file_name(format!(".{database}.lock.stale-{run_id}"));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BackupError::Io(e)),
        }
        let moved = read_lease(&aside, lease).ok();
        match moved {
            Some(moved) if moved.expires_at > now => {
                // put the live lease back; hard_link refuses to clobber a newer one
                let _ = fs::hard_link(&aside, path);
                let _ = fs::remove_file(&aside);
                Err(BackupError::LockContention {
                    database: database.to_string(),
                    holder: moved.run_id,
                    expires_at: moved.expires_at,
                })
            }
            _ => {
                warn!(
                    database = %database,
                    stale_holder = %current.run_id,
                    expired_at = %current.expires_at,
                    "taking over expired run lock"
                );
                let _ = fs::remove_file(&aside);
                Ok(())
            }
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Release the lease, only removing the file while this run still owns it.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match read_lease(&self.path, Duration::zero()) {
            Ok(record) if record.run_id == self.run_id => {
                fs::remove_file(&self.path)?;
                debug!(database = %self.database, run_id = %self.run_id, "released run lock");
                Ok(())
            }
            Ok(record) => {
                warn!(
                    database = %self.database,
                    run_id = %self.run_id,
                    new_holder = %record.run_id,
                    "run lock was taken over before release"
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::Io(e)),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(database = %self.database, error = %e, "failed to release run lock");
        }
    }
}

/// Read a lease file. A file that does not parse (a writer died mid-write) is
/// treated as a lease that started at its modification time.
fn read_lease(path: &Path, lease: Duration) -> io::Result<LeaseRecord> {
    let raw = fs::read(path)?;
    if let Ok(record) = serde_json::from_slice::<LeaseRecord>(&raw) {
        return Ok(record);
    }
    let modified: DateTime<Utc> = fs::metadata(path)?
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into();
    Ok(LeaseRecord {
        run_id: "unknown".to_string(),
        pid: 0,
        acquired_at: modified,
        expires_at: modified + lease,
    })
}
