/*!
The backup lifecycle engine.

[`BackupOrchestrator`] sequences one run of
`Idle → Snapshotting → Transforming → LocalPersisting → RemoteSyncing → Pruning →
Completed`, records a [`StepResult`](crate::run::StepResult) for each of the six steps
and returns the sealed [`BackupRun`].

Failure policy:
- a failure up to and including local persistence aborts the run with `Failure`;
  nothing is registered and earlier artifacts are untouched
- a failure in remote sync or pruning yields `PartialFailure`; the local artifact
  stays and [`BackupOrchestrator::resync`] retries just those steps
- remote deletions only happen on tiers that confirmed the newest local artifact in
  the same run, and only with `auto_prune` enabled

Snapshotting and transforming are not separate passes: the snapshot stream is pulled
through the transform stages by the local store, so the three step results are
settled together once the stream has been drained.
*/

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::Artifact;
use crate::clock::{Clock, SystemClock};
use crate::config::BackstopConfig;
use crate::credentials::CredentialProvider;
use crate::error::ErrorKind;
use crate::local_store::LocalStore;
use crate::lock::RunLock;
use crate::naming::{validate_database_identifier, ArtifactNamer};
use crate::notify::{AlertSink, FailureEvent, TracingAlertSink};
use crate::remote::{KeyFailure, RemoteStore, SyncReport};
use crate::retention::{self, RetentionWindow};
use crate::run::{BackupRun, InFlightRun, RunState, Step};
use crate::source::{CommandSnapshotSource, ConsistencyMode, SnapshotDeadline, SnapshotSource};
use crate::transform::TransformPipeline;
use crate::{BackupError, Result};

#[cfg(feature = "metrics")]
use crate::observability::BackupMetrics;

/// Parameters of one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub database: String,
    pub consistency_mode: ConsistencyMode,
    pub retention: RetentionWindow,
    /// Names of configured remote tiers to mirror to; empty skips remote steps
    pub remote_targets: Vec<String>,
}

impl Trigger {
    pub fn new<S: Into<String>>(
        database: S,
        consistency_mode: ConsistencyMode,
        retention: RetentionWindow,
        remote_targets: Vec<String>,
    ) -> Self {
        Self {
            database: database.into(),
            consistency_mode,
            retention,
            remote_targets,
        }
    }

    /// Trigger using the configured retention and every configured remote
    pub fn from_config<S: Into<String>>(database: S, config: &BackstopConfig) -> Result<Self> {
        Ok(Self::new(
            database,
            ConsistencyMode::SingleTransaction,
            config.retention_window()?,
            config.remote_names(),
        ))
    }
}

/// Outcome of the snapshot, transform and persist steps
enum Produced {
    Artifact(Artifact),
    Aborted,
}

/// Main engine for backup runs
///
/// The orchestrator owns the in-flight run exclusively. Stores own their
/// inventories; retention is computed, never stored.
pub struct BackupOrchestrator {
    config: BackstopConfig,
    source: Arc<dyn SnapshotSource>,
    local: LocalStore,
    remotes: Vec<RemoteStore>,
    pipeline: TransformPipeline,
    namer: ArtifactNamer,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
}

impl BackupOrchestrator {
    /// Create an orchestrator from explicit collaborators.
    ///
    /// `remotes` must carry one store for every remote a trigger may name. The
    /// passphrase handle in `config.transform`, if any, is resolved once here.
    pub fn new(
        config: BackstopConfig,
        source: Arc<dyn SnapshotSource>,
        remotes: Vec<RemoteStore>,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = TransformPipeline::from_options(&config.transform, credentials)?;
        let namer = ArtifactNamer::new(config.naming.granularity_minutes, pipeline.extension())?;
        let local = LocalStore::open(&config.local.root)?;

        let mut seen = std::collections::HashSet::new();
        for remote in &remotes {
            if !seen.insert(remote.name().to_string()) {
                return Err(BackupError::validation(format!(
                    "remote '{}' was supplied more than once",
                    remote.name()
                )));
            }
        }

        info!(
            source = %source.name(),
            local_root = %config.local.root.display(),
            pipeline = %pipeline.describe(),
            remotes = remotes.len(),
            auto_prune = config.auto_prune,
            "Initialized backup orchestrator"
        );

        Ok(Self {
            config,
            source,
            local,
            remotes,
            pipeline,
            namer,
            clock: Arc::new(SystemClock),
            alerts: Arc::new(TracingAlertSink),
        })
    }

    /// Create an orchestrator with the command source and the remote tiers described
    /// by `config`.
    pub fn from_config(config: BackstopConfig, credentials: &dyn CredentialProvider) -> Result<Self> {
        config.validate()?;
        let password = config
            .source
            .password
            .as_ref()
            .map(|handle| credentials.resolve(handle))
            .transpose()?;
        let source = CommandSnapshotSource::new(config.source.clone(), password)?;

        let remotes = config
            .remotes
            .iter()
            .map(|remote| {
                let storage = remote.build(config.operation_timeout())?;
                Ok(RemoteStore::new(storage).with_retry_policy(config.retry.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(config, Arc::new(source), remotes, credentials)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &BackstopConfig {
        &self.config
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    pub fn remotes(&self) -> &[RemoteStore] {
        &self.remotes
    }

    pub fn pipeline(&self) -> &TransformPipeline {
        &self.pipeline
    }

    pub fn remote(&self, name: &str) -> Option<&RemoteStore> {
        self.remotes.iter().find(|r| r.name() == name)
    }

    /// Run the full lifecycle once.
    ///
    /// Returns `Err` only when the run could not start: an invalid trigger or another
    /// run holding the database's lock. Every other outcome is a [`BackupRun`].
    pub fn run_once(&self, trigger: &Trigger) -> Result<BackupRun> {
        self.run_once_with_cancel(trigger, &CancellationToken::new())
    }

    /// Like [`run_once`](Self::run_once); cancelling `cancel` stops a snapshot that
    /// is still streaming and fails the run.
    pub fn run_once_with_cancel(&self, trigger: &Trigger, cancel: &CancellationToken) -> Result<BackupRun> {
        let targets = self.resolve_targets(trigger)?;
        let started_at = self.clock.now();
        let mut run = InFlightRun::new(&trigger.database, started_at);
        let lock = self.acquire_lock(&run, started_at)?;

        info!(
            run_id = %run.id(),
            database = %trigger.database,
            mode = %trigger.consistency_mode,
            targets = ?trigger.remote_targets,
            "starting backup run"
        );

        let produced = self.produce_artifact(&mut run, trigger, started_at, cancel);
        if let Produced::Artifact(artifact) = produced {
            let newest = artifact.key().to_string();
            run.set_artifact(artifact);
            self.sync_and_prune(&mut run, trigger, &targets, Some(&newest));
        }

        Ok(self.complete(run, lock))
    }

    /// Re-attempt remote sync and pruning for the existing verified artifacts of a
    /// database, without taking a snapshot.
    pub fn resync(&self, trigger: &Trigger) -> Result<BackupRun> {
        let targets = self.resolve_targets(trigger)?;
        let started_at = self.clock.now();
        let mut run = InFlightRun::new(&trigger.database, started_at);
        let lock = self.acquire_lock(&run, started_at)?;

        info!(run_id = %run.id(), database = %trigger.database, "starting resync");
        for step in [Step::Snapshot, Step::Transform, Step::LocalPersist] {
            run.skip(step, started_at, "resync reuses existing artifacts");
        }

        let newest = match self.local_inventory(&trigger.database) {
            Ok(inventory) => inventory
                .into_iter()
                .filter(Artifact::is_verified)
                .max_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.key().cmp(b.key())))
                .map(|a| a.key().to_string()),
            Err(err) => {
                let now = self.clock.now();
                run.fail(Step::RemoteSync, started_at, now, &err);
                return Ok(self.complete(run, lock));
            }
        };
        self.sync_and_prune(&mut run, trigger, &targets, newest.as_deref());

        Ok(self.complete(run, lock))
    }

    fn resolve_targets(&self, trigger: &Trigger) -> Result<Vec<RemoteStore>> {
        validate_database_identifier(&trigger.database)?;
        trigger
            .remote_targets
            .iter()
            .map(|name| {
                self.remote(name).cloned().ok_or_else(|| {
                    BackupError::validation(format!("unknown remote target '{name}'"))
                })
            })
            .collect()
    }

    fn acquire_lock(&self, run: &InFlightRun, now: DateTime<Utc>) -> Result<RunLock> {
        RunLock::acquire(
            self.local.root(),
            run.database(),
            &run.id().to_string(),
            self.config.lock_lease(),
            now,
        )
        .inspect_err(|err| {
            warn!(database = %run.database(), error = %err, "backup run not started");
        })
    }

    fn enter(&self, run: &mut InFlightRun, state: RunState) {
        let from = run.transition(state);
        info!(run_id = %run.id(), database = %run.database(), from = %from, to = %state, "run state transition");
    }

    /// Snapshotting, Transforming and LocalPersisting.
    fn produce_artifact(
        &self,
        run: &mut InFlightRun,
        trigger: &Trigger,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Produced {
        let database = trigger.database.as_str();
        self.enter(run, RunState::Snapshotting);
        let snapshot_started = self.clock.now();

        let key = match self
            .local_inventory(database)
            .and_then(|inventory| {
                let keys: Vec<&str> = inventory.iter().map(|a| a.key()).collect();
                self.namer.name(database, now, &keys)
            }) {
            Ok(key) => key,
            Err(err) => {
                let at = self.clock.now();
                run.skip(Step::Snapshot, at, "no artifact key available");
                run.skip(Step::Transform, at, "no artifact key available");
                run.fail(Step::LocalPersist, snapshot_started, at, &err);
                return Produced::Aborted;
            }
        };
        debug!(run_id = %run.id(), key = %key, "assigned artifact key");

        let deadline = SnapshotDeadline::start(cancel.child_token(), self.config.snapshot_timeout());
        let raw = match self
            .source
            .take_snapshot(database, trigger.consistency_mode, deadline.token())
        {
            Ok(raw) => deadline.guard(raw),
            Err(err) => {
                run.fail(Step::Snapshot, snapshot_started, self.clock.now(), &err);
                return Produced::Aborted;
            }
        };

        self.enter(run, RunState::Transforming);
        let transform_started = self.clock.now();
        let mut stored = match self.pipeline.apply(raw) {
            Ok(stream) => stream,
            Err(err) => {
                let at = self.clock.now();
                run.succeed(Step::Snapshot, snapshot_started, at);
                run.fail(Step::Transform, transform_started, at, &err);
                return Produced::Aborted;
            }
        };

        self.enter(run, RunState::LocalPersisting);
        let persisted = self.local.persist(&key, database, now, &mut stored);
        drop(stored);
        let drained = self.clock.now();

        let mut artifact = match persisted {
            Ok(artifact) => artifact,
            Err(err) => {
                match err.kind() {
                    ErrorKind::Source => {
                        run.fail(Step::Snapshot, snapshot_started, drained, &err);
                    }
                    ErrorKind::Transform => {
                        run.succeed(Step::Snapshot, snapshot_started, drained);
                        run.fail(Step::Transform, transform_started, drained, &err);
                    }
                    _ => {
                        run.succeed(Step::Snapshot, snapshot_started, drained);
                        run.succeed(Step::Transform, transform_started, drained);
                        run.fail(Step::LocalPersist, snapshot_started, drained, &err);
                    }
                }
                error!(run_id = %run.id(), key = %key, error = %err, "snapshot was not persisted");
                return Produced::Aborted;
            }
        };
        run.succeed(Step::Snapshot, snapshot_started, drained);
        run.succeed(Step::Transform, transform_started, drained);

        match self.local.verify(&mut artifact) {
            Ok(true) => {
                run.succeed(Step::LocalPersist, snapshot_started, self.clock.now());
                info!(
                    run_id = %run.id(),
                    key = %artifact.key(),
                    size_bytes = artifact.size_bytes(),
                    checksum = %artifact.checksum(),
                    "artifact persisted and verified"
                );
                Produced::Artifact(artifact)
            }
            Ok(false) => {
                let err = BackupError::IntegrityCheckFailed {
                    key: artifact.key().to_string(),
                    expected: artifact.checksum().to_string(),
                    actual: "read-back mismatch".to_string(),
                };
                self.discard(run, &artifact);
                run.fail(Step::LocalPersist, snapshot_started, self.clock.now(), &err);
                Produced::Aborted
            }
            Err(err) => {
                self.discard(run, &artifact);
                run.fail(Step::LocalPersist, snapshot_started, self.clock.now(), &err);
                Produced::Aborted
            }
        }
    }

    /// Remove an artifact that failed verification so it never enters an inventory
    fn discard(&self, run: &InFlightRun, artifact: &Artifact) {
        match self.local.delete(artifact.key()) {
            Ok(()) | Err(BackupError::NotFound(_)) => {
                warn!(run_id = %run.id(), key = %artifact.key(), "discarded unverifiable artifact");
            }
            Err(err) => {
                error!(run_id = %run.id(), key = %artifact.key(), error = %err, "failed to discard unverifiable artifact");
            }
        }
    }

    fn local_inventory(&self, database: &str) -> Result<Vec<Artifact>> {
        Ok(self
            .local
            .list()?
            .into_iter()
            .filter(|a| a.database() == database)
            .collect())
    }

    /// RemoteSyncing and Pruning. `newest` is the artifact remote deletions are
    /// gated on.
    fn sync_and_prune(
        &self,
        run: &mut InFlightRun,
        trigger: &Trigger,
        targets: &[RemoteStore],
        newest: Option<&str>,
    ) {
        self.enter(run, RunState::RemoteSyncing);
        let confirmed = self.remote_sync(run, trigger, targets, newest);

        self.enter(run, RunState::Pruning);
        self.local_prune(run, trigger);
        self.remote_prune(run, trigger, targets, newest, &confirmed);
    }

    /// Mirror to every target in parallel; returns the tiers that confirmed `newest`.
    fn remote_sync(
        &self,
        run: &mut InFlightRun,
        trigger: &Trigger,
        targets: &[RemoteStore],
        newest: Option<&str>,
    ) -> Vec<String> {
        let started = self.clock.now();
        if targets.is_empty() {
            run.skip(Step::RemoteSync, started, "no remote targets");
            return Vec::new();
        }

        let inventory = match self.local_inventory(&trigger.database) {
            Ok(inventory) => inventory,
            Err(err) => {
                run.fail(Step::RemoteSync, started, self.clock.now(), &err);
                return Vec::new();
            }
        };

        let outcomes: Vec<(String, Result<SyncReport>)> = targets
            .par_iter()
            .map(|remote| (remote.name().to_string(), remote.sync(&self.local, &inventory)))
            .collect();

        let mut confirmed = Vec::new();
        let mut failures: Vec<(String, ErrorKind, String)> = Vec::new();
        for (tier, outcome) in outcomes {
            let report = match outcome {
                Ok(report) => report,
                Err(BackupError::PartialSync(report)) => {
                    let first: Option<&KeyFailure> = report.failed.first();
                    let kind = first.map(|f| f.kind).unwrap_or(ErrorKind::PartialSync);
                    let message = format!(
                        "{}: {} uploaded, {} failed ({})",
                        tier,
                        report.uploaded.len(),
                        report.failed.len(),
                        first.map(|f| f.message.as_str()).unwrap_or("unknown error")
                    );
                    failures.push((tier.clone(), kind, message));
                    *report
                }
                Err(err) => {
                    warn!(run_id = %run.id(), tier = %tier, error = %err, "remote sync failed");
                    #[cfg(feature = "metrics")]
                    BackupMetrics::global().record_remote_error(&tier);
                    failures.push((tier.clone(), err.kind(), format!("{tier}: {err}")));
                    continue;
                }
            };
            if newest.is_some_and(|key| report.confirms(key)) {
                confirmed.push(tier.clone());
            }
            info!(
                run_id = %run.id(),
                tier = %tier,
                uploaded = report.uploaded.len(),
                in_sync = report.in_sync.len(),
                failed = report.failed.len(),
                "remote sync finished"
            );
            run.add_sync_report(report);
        }

        let finished = self.clock.now();
        match failures.first() {
            None => run.succeed(Step::RemoteSync, started, finished),
            Some((_, kind, _)) => {
                let message = failures
                    .iter()
                    .map(|(_, _, m)| m.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                run.fail_with(Step::RemoteSync, started, finished, *kind, message);
            }
        }
        confirmed
    }

    fn local_prune(&self, run: &mut InFlightRun, trigger: &Trigger) {
        let started = self.clock.now();
        let inventory = match self.local_inventory(&trigger.database) {
            Ok(inventory) => inventory,
            Err(err) => {
                run.fail(Step::LocalPrune, started, self.clock.now(), &err);
                return;
            }
        };

        let expired = retention::expired(&inventory, &trigger.retention, started);
        let mut failures = Vec::new();
        for mut artifact in inventory.into_iter().filter(|a| expired.contains(a.key())) {
            match self.local.retire(&mut artifact) {
                Ok(()) => run.add_pruned_local(artifact.key().to_string()),
                Err(err) => {
                    warn!(run_id = %run.id(), key = %artifact.key(), error = %err, "local prune failed");
                    failures.push(err);
                }
            }
        }

        let finished = self.clock.now();
        match failures.first() {
            None => run.succeed(Step::LocalPrune, started, finished),
            Some(first) => {
                let message = format!("{} expired artifact(s) not deleted: {first}", failures.len());
                run.fail_with(Step::LocalPrune, started, finished, first.kind(), message);
            }
        }
    }

    fn remote_prune(
        &self,
        run: &mut InFlightRun,
        trigger: &Trigger,
        targets: &[RemoteStore],
        newest: Option<&str>,
        confirmed: &[String],
    ) {
        let started = self.clock.now();
        if !self.config.auto_prune {
            run.skip(Step::RemotePrune, started, "auto_prune disabled");
            return;
        }
        if targets.is_empty() || newest.is_none() {
            run.skip(Step::RemotePrune, started, "no remote tier to prune");
            return;
        }

        let eligible: Vec<&RemoteStore> = targets
            .iter()
            .filter(|remote| confirmed.iter().any(|name| name == remote.name()))
            .collect();
        for remote in targets.iter().filter(|r| !confirmed.iter().any(|n| n == r.name())) {
            warn!(
                run_id = %run.id(),
                tier = %remote.name(),
                "tier did not confirm the newest artifact, not pruning it"
            );
        }
        if eligible.is_empty() {
            run.skip(Step::RemotePrune, started, "no tier confirmed the newest artifact");
            return;
        }

        let outcomes: Vec<(String, Result<_>)> = eligible
            .par_iter()
            .map(|remote| {
                (
                    remote.name().to_string(),
                    remote.prune(&trigger.database, &trigger.retention, started),
                )
            })
            .collect();

        let mut failures: Vec<(ErrorKind, String)> = Vec::new();
        for (tier, outcome) in outcomes {
            match outcome {
                Ok(report) => {
                    if let Some(first) = report.failed.first() {
                        failures.push((
                            first.kind,
                            format!("{tier}: {} key(s) not deleted ({})", report.failed.len(), first.message),
                        ));
                    }
                    info!(
                        run_id = %run.id(),
                        tier = %tier,
                        deleted = report.deleted.len(),
                        failed = report.failed.len(),
                        "remote prune finished"
                    );
                    run.add_prune_report(report);
                }
                Err(err) => {
                    warn!(run_id = %run.id(), tier = %tier, error = %err, "remote prune failed");
                    #[cfg(feature = "metrics")]
                    BackupMetrics::global().record_remote_error(&tier);
                    failures.push((err.kind(), format!("{tier}: {err}")));
                }
            }
        }

        let finished = self.clock.now();
        match failures.first() {
            None => run.succeed(Step::RemotePrune, started, finished),
            Some((kind, _)) => {
                let message = failures
                    .iter()
                    .map(|(_, m)| m.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                run.fail_with(Step::RemotePrune, started, finished, *kind, message);
            }
        }
    }

    /// Seal the run, release the lock and report.
    fn complete(&self, mut run: InFlightRun, lock: RunLock) -> BackupRun {
        let status = run.status();
        self.enter(&mut run, RunState::Completed(status));
        let run = run.finish(self.clock.now());

        if let Err(err) = lock.release() {
            warn!(run_id = %run.id(), error = %err, "failed to release run lock");
        }

        #[cfg(feature = "metrics")]
        BackupMetrics::global().record_run(&run);

        if let Some(event) = FailureEvent::from_run(&run) {
            if let Err(err) = self.alerts.emit(&event) {
                error!(run_id = %run.id(), error = %err, "failed to emit failure event");
            }
        }

        info!(
            run_id = %run.id(),
            database = %run.database(),
            status = %run.status(),
            artifact = run.artifact().map(|a| a.key()).unwrap_or("-"),
            pruned_local = run.pruned_local().len(),
            "backup run completed"
        );
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use crate::clock::ManualClock;
    use crate::error::SourceFault;
    use crate::run::{RunStatus, StepStatus};
    use crate::storage::MemoryObjectStorage;
    use crate::transform::ByteStream;
    use backstop_retry::RetryPolicy;
    use chrono::TimeZone;
    use std::io::{self, Cursor, Read};
    use tempfile::TempDir;

    struct FixedSource(Vec<u8>);

    impl SnapshotSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        fn take_snapshot(&self, _: &str, _: ConsistencyMode, _: &CancellationToken) -> Result<ByteStream> {
            Ok(Box::new(Cursor::new(self.0.clone())))
        }
    }

    struct DyingSource;

    impl SnapshotSource for DyingSource {
        fn name(&self) -> &str {
            "dying"
        }

        fn take_snapshot(&self, _: &str, _: ConsistencyMode, _: &CancellationToken) -> Result<ByteStream> {
            struct Dying(usize);
            impl Read for Dying {
                fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                    if self.0 == 0 {
                        return Err(SourceFault("mysqldump exited with status 2".to_string()).into_io());
                    }
                    self.0 -= 1;
                    let n = buf.len().min(16);
                    buf[..n].fill(b'x');
                    Ok(n)
                }
            }
            Ok(Box::new(Dying(4)))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap()
    }

    fn orchestrator(
        dir: &TempDir,
        source: Arc<dyn SnapshotSource>,
        remotes: Vec<RemoteStore>,
    ) -> (BackupOrchestrator, Arc<ManualClock>) {
        let mut config = BackstopConfig::default();
        config.local.root = dir.path().join("local");
        let clock = Arc::new(ManualClock::new(t0()));
        let orchestrator = BackupOrchestrator::new(config, source, remotes, &StaticCredentialProvider::new())
            .unwrap()
            .with_clock(clock.clone());
        (orchestrator, clock)
    }

    fn trigger(targets: &[&str]) -> Trigger {
        Trigger::new(
            "orders",
            ConsistencyMode::SingleTransaction,
            RetentionWindow::days(30, 3).unwrap(),
            targets.iter().map(|t| t.to_string()).collect(),
        )
    }

    #[test]
    fn test_run_without_remotes_succeeds() {
        let dir = TempDir::new().unwrap();
        let (orch, _) = orchestrator(&dir, Arc::new(FixedSource(b"-- dump\n".repeat(100))), Vec::new());

        let run = orch.run_once(&trigger(&[])).unwrap();
        assert_eq!(run.status(), RunStatus::Success);
        assert_eq!(run.step(Step::RemoteSync).unwrap().status, StepStatus::Skipped);
        assert_eq!(run.step(Step::RemotePrune).unwrap().status, StepStatus::Skipped);

        let artifact = run.artifact().unwrap();
        assert_eq!(artifact.key(), "orders_2024-05-01_0200.sql.gz");
        assert!(artifact.is_verified());
        assert_eq!(orch.local_store().list().unwrap().len(), 1);
    }

    #[test]
    fn test_source_failure_aborts_without_artifact() {
        let dir = TempDir::new().unwrap();
        let (orch, _) = orchestrator(&dir, Arc::new(DyingSource), Vec::new());

        let run = orch.run_once(&trigger(&[])).unwrap();
        assert_eq!(run.status(), RunStatus::Failure);
        let failure = run.first_failure().unwrap();
        assert_eq!(failure.step, Step::Snapshot);
        assert_eq!(failure.error_kind, Some(ErrorKind::Source));
        assert!(run.artifact().is_none());
        assert!(orch.local_store().list().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_window_fails_local_persist() {
        let dir = TempDir::new().unwrap();
        let (orch, _) = orchestrator(&dir, Arc::new(FixedSource(b"data".to_vec())), Vec::new());

        assert_eq!(orch.run_once(&trigger(&[])).unwrap().status(), RunStatus::Success);
        let second = orch.run_once(&trigger(&[])).unwrap();
        assert_eq!(second.status(), RunStatus::Failure);
        let failure = second.first_failure().unwrap();
        assert_eq!(failure.step, Step::LocalPersist);
        assert_eq!(failure.error_kind, Some(ErrorKind::DuplicateKey));
    }

    #[test]
    fn test_unknown_target_is_rejected_before_running() {
        let dir = TempDir::new().unwrap();
        let (orch, _) = orchestrator(&dir, Arc::new(FixedSource(b"data".to_vec())), Vec::new());
        let err = orch.run_once(&trigger(&["nowhere"])).unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
        assert!(orch.local_store().list().unwrap().is_empty());
    }

    #[test]
    fn test_remote_prune_requires_auto_prune() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryObjectStorage::new("offsite"));
        let remote = RemoteStore::new(storage.clone()).with_retry_policy(RetryPolicy::none());
        let (orch, _) = orchestrator(&dir, Arc::new(FixedSource(b"data".to_vec())), vec![remote]);

        let run = orch.run_once(&trigger(&["offsite"])).unwrap();
        assert_eq!(run.status(), RunStatus::Success);
        assert_eq!(storage.keys(), vec!["orders_2024-05-01_0200.sql.gz".to_string()]);
        let prune = run.step(Step::RemotePrune).unwrap();
        assert_eq!(prune.status, StepStatus::Skipped);
        assert_eq!(prune.message.as_deref(), Some("auto_prune disabled"));
    }
}
