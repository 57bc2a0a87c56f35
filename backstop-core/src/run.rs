/*!
Run records.

An [`InFlightRun`] is owned and mutated by the orchestrator while a run is in
progress. [`InFlightRun::finish`] seals it into an immutable [`BackupRun`], the only
form that leaves the orchestrator.
*/

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::error::{BackupError, ErrorKind};
use crate::remote::{PruneReport, SyncReport};

/// The six steps of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Step {
    Snapshot,
    Transform,
    LocalPersist,
    RemoteSync,
    LocalPrune,
    RemotePrune,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::Snapshot,
        Step::Transform,
        Step::LocalPersist,
        Step::RemoteSync,
        Step::LocalPrune,
        Step::RemotePrune,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Snapshot => "Snapshot",
            Step::Transform => "Transform",
            Step::LocalPersist => "LocalPersist",
            Step::RemoteSync => "RemoteSync",
            Step::LocalPrune => "LocalPrune",
            Step::RemotePrune => "RemotePrune",
        }
    }

    /// Failures up to and including local persistence abort the run
    pub fn is_critical(&self) -> bool {
        matches!(self, Step::Snapshot | Step::Transform | Step::LocalPersist)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step: Step,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
}

impl RunStatus {
    /// Process exit code reported to the trigger
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failure => 1,
            RunStatus::PartialFailure => 2,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("Success"),
            RunStatus::PartialFailure => f.write_str("PartialFailure"),
            RunStatus::Failure => f.write_str("Failure"),
        }
    }
}

/// Orchestrator state, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Snapshotting,
    Transforming,
    LocalPersisting,
    RemoteSyncing,
    Pruning,
    Completed(RunStatus),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Completed(status) => write!(f, "Completed({status})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Mutable record of a run in progress
#[derive(Debug)]
pub struct InFlightRun {
    id: Uuid,
    database: String,
    started_at: DateTime<Utc>,
    state: RunState,
    steps: Vec<StepResult>,
    artifact: Option<Artifact>,
    sync_reports: Vec<SyncReport>,
    prune_reports: Vec<PruneReport>,
    pruned_local: Vec<String>,
}

impl InFlightRun {
    pub fn new(database: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            database: database.to_string(),
            started_at,
            state: RunState::Idle,
            steps: Vec::with_capacity(Step::ALL.len()),
            artifact: None,
            sync_reports: Vec::new(),
            prune_reports: Vec::new(),
            pruned_local: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Move to `state`, returning the previous one
    pub fn transition(&mut self, state: RunState) -> RunState {
        std::mem::replace(&mut self.state, state)
    }

    pub fn succeed(&mut self, step: Step, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) {
        self.push(step, StepStatus::Succeeded, started_at, finished_at, None, None);
    }

    pub fn fail(
        &mut self,
        step: Step,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: &BackupError,
    ) {
        self.push(
            step,
            StepStatus::Failed,
            started_at,
            finished_at,
            Some(error.kind()),
            Some(error.to_string()),
        );
    }

    pub fn fail_with(
        &mut self,
        step: Step,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        kind: ErrorKind,
        message: String,
    ) {
        self.push(step, StepStatus::Failed, started_at, finished_at, Some(kind), Some(message));
    }

    pub fn skip<S: Into<String>>(&mut self, step: Step, at: DateTime<Utc>, reason: S) {
        self.push(step, StepStatus::Skipped, at, at, None, Some(reason.into()));
    }

    fn push(
        &mut self,
        step: Step,
        status: StepStatus,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error_kind: Option<ErrorKind>,
        message: Option<String>,
    ) {
        self.steps.push(StepResult {
            step,
            status,
            started_at,
            finished_at,
            error_kind,
            message,
        });
    }

    pub fn set_artifact(&mut self, artifact: Artifact) {
        self.artifact = Some(artifact);
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn add_sync_report(&mut self, report: SyncReport) {
        self.sync_reports.push(report);
    }

    pub fn add_prune_report(&mut self, report: PruneReport) {
        self.prune_reports.push(report);
    }

    pub fn add_pruned_local(&mut self, key: String) {
        self.pruned_local.push(key);
    }

    pub fn status(&self) -> RunStatus {
        status_of(&self.steps)
    }

    /// Seal the run; any step never reached is recorded as skipped.
    pub fn finish(mut self, finished_at: DateTime<Utc>) -> BackupRun {
        for step in Step::ALL {
            if !self.steps.iter().any(|r| r.step == step) {
                self.skip(step, finished_at, "not reached");
            }
        }
        self.steps
            .sort_by_key(|r| Step::ALL.iter().position(|s| *s == r.step));
        let status = status_of(&self.steps);
        BackupRun {
            id: self.id,
            database: self.database,
            started_at: self.started_at,
            finished_at,
            status,
            steps: self.steps,
            artifact: self.artifact,
            sync_reports: self.sync_reports,
            prune_reports: self.prune_reports,
            pruned_local: self.pruned_local,
        }
    }
}

fn status_of(steps: &[StepResult]) -> RunStatus {
    let failed = |r: &&StepResult| r.status == StepStatus::Failed;
    if steps.iter().filter(failed).any(|r| r.step.is_critical()) {
        RunStatus::Failure
    } else if steps.iter().any(|r| r.status == StepStatus::Failed) {
        RunStatus::PartialFailure
    } else {
        RunStatus::Success
    }
}

/// Immutable summary of one finished run
#[derive(Debug, Clone, Serialize)]
pub struct BackupRun {
    id: Uuid,
    database: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    status: RunStatus,
    steps: Vec<StepResult>,
    artifact: Option<Artifact>,
    sync_reports: Vec<SyncReport>,
    prune_reports: Vec<PruneReport>,
    pruned_local: Vec<String>,
}

impl BackupRun {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// Step results in execution order
    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    pub fn step(&self, step: Step) -> Option<&StepResult> {
        self.steps.iter().find(|r| r.step == step)
    }

    /// The artifact this run produced, if it got that far
    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn sync_reports(&self) -> &[SyncReport] {
        &self.sync_reports
    }

    pub fn prune_reports(&self) -> &[PruneReport] {
        &self.prune_reports
    }

    pub fn pruned_local(&self) -> &[String] {
        &self.pruned_local
    }

    /// First failed step in execution order
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.steps.iter().find(|r| r.status == StepStatus::Failed)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
