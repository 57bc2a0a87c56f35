//! Failure notifications.
//!
//! The orchestrator emits one [`FailureEvent`] per run that does not end in
//! `Success`. Delivering it anywhere beyond a log line or a local file is left to
//! whatever consumes the sink.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::run::{BackupRun, RunStatus, Step};
use crate::{BackupError, Result};

/// Structured failure signal for an alerting system
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEvent {
    pub run_id: Uuid,
    pub database: String,
    pub status: RunStatus,
    pub failing_step: Option<Step>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl FailureEvent {
    /// `None` for successful runs
    pub fn from_run(run: &BackupRun) -> Option<Self> {
        if run.status() == RunStatus::Success {
            return None;
        }
        let failure = run.first_failure();
        Some(Self {
            run_id: run.id(),
            database: run.database().to_string(),
            status: run.status(),
            failing_step: failure.map(|r| r.step),
            error_kind: failure.and_then(|r| r.error_kind),
            message: failure.and_then(|r| r.message.clone()),
            occurred_at: run.finished_at(),
        })
    }
}

/// Destination for failure events
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: &FailureEvent) -> Result<()>;
}

/// Emits each event as an `error!` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, event: &FailureEvent) -> Result<()> {
        error!(
            run_id = %event.run_id,
            database = %event.database,
            status = %event.status,
            step = event.failing_step.map(|s| s.as_str()).unwrap_or("-"),
            error_kind = event.error_kind.map(|k| k.as_str()).unwrap_or("-"),
            message = event.message.as_deref().unwrap_or(""),
            "backup run failed"
        );
        Ok(())
    }
}

/// Appends one JSON object per event to a file
#[derive(Debug)]
pub struct JsonLinesAlertSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAlertSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BackupError::from_write_error(e, format!("open alert log {}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertSink for JsonLinesAlertSink {
    fn emit(&self, event: &FailureEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|e| BackupError::from_write_error(e, "append alert event"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::InFlightRun;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn failed_run() -> BackupRun {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        let mut run = InFlightRun::new("orders", t);
        run.succeed(Step::Snapshot, t, t);
        run.succeed(Step::Transform, t, t);
        run.succeed(Step::LocalPersist, t, t);
        run.fail(Step::RemoteSync, t, t, &BackupError::auth("access denied"));
        run.finish(t)
    }

    #[test]
    fn test_event_names_first_failure() {
        let event = FailureEvent::from_run(&failed_run()).unwrap();
        assert_eq!(event.database, "orders");
        assert_eq!(event.status, RunStatus::PartialFailure);
        assert_eq!(event.failing_step, Some(Step::RemoteSync));
        assert_eq!(event.error_kind, Some(ErrorKind::Auth));
        assert!(event.message.unwrap().contains("access denied"));
    }

    #[test]
    fn test_no_event_for_success() {
        let t = Utc::now();
        let mut run = InFlightRun::new("orders", t);
        for step in Step::ALL {
            run.succeed(step, t, t);
        }
        assert!(FailureEvent::from_run(&run.finish(t)).is_none());
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let event = FailureEvent::from_run(&failed_run()).unwrap();

        let sink = JsonLinesAlertSink::open(&path).unwrap();
        sink.emit(&event).unwrap();
        sink.emit(&event).unwrap();
        drop(sink);
        JsonLinesAlertSink::open(&path).unwrap().emit(&event).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["failing_step"], "RemoteSync");
        assert_eq!(parsed["error_kind"], "AuthError");
        assert_eq!(parsed["status"], "PartialFailure");
    }
}
