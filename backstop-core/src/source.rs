/*!
Snapshot sources.

A [`SnapshotSource`] turns a database identifier into a lazy byte stream of a
consistent dump. A stream that stops early must never look like a finished dump:
[`CommandSnapshotSource`] reconciles the dump tool's exit status and an optional
completion marker before reporting end of stream, and raises a [`SourceFault`]
otherwise.

Cancellation goes through a [`CancellationToken`]. Cancelling kills a running dump
process, which closes its connection to the database.
*/

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialHandle, Secret};
use crate::error::SourceFault;
use crate::transform::ByteStream;
use crate::{BackupError, Result};

const STDERR_TAIL_BYTES: usize = 4 * 1024;
const MARKER_SLACK_BYTES: usize = 256;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How the source obtains a consistent view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// One repeatable-read transaction; writers are not blocked
    SingleTransaction,
    /// Table locks for the duration of the dump
    LockTables,
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleTransaction => f.write_str("single_transaction"),
            Self::LockTables => f.write_str("lock_tables"),
        }
    }
}

/// Producer of raw, consistent database dumps
pub trait SnapshotSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Start a dump of `database` and return its byte stream.
    ///
    /// Errors surfacing from the stream's `read` must carry a [`SourceFault`] so they
    /// stay attributable to the source after passing through transform stages.
    /// Implementations stop producing data once `cancel` fires.
    fn take_snapshot(
        &self,
        database: &str,
        mode: ConsistencyMode,
        cancel: &CancellationToken,
    ) -> Result<ByteStream>;
}

/// Dump command description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSourceConfig {
    pub program: String,
    /// Arguments after the consistency flags; `{database}` is substituted
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub single_transaction_args: Vec<String>,
    #[serde(default)]
    pub lock_tables_args: Vec<String>,
    /// Handle of the database password
    #[serde(default)]
    pub password: Option<CredentialHandle>,
    /// Environment variable the tool reads its password from
    #[serde(default)]
    pub password_env: Option<String>,
    /// Text the tool writes at the very end of a complete dump
    #[serde(default)]
    pub completion_marker: Option<String>,
}

impl CommandSourceConfig {
    /// `mysqldump` with routines, triggers and events
    pub fn mysqldump() -> Self {
        Self {
            program: "mysqldump".to_string(),
            args: vec![
                "--routines".to_string(),
                "--triggers".to_string(),
                "--events".to_string(),
                "{database}".to_string(),
            ],
            single_transaction_args: vec!["--single-transaction".to_string()],
            lock_tables_args: vec!["--lock-tables".to_string()],
            password: None,
            password_env: Some("MYSQL_PWD".to_string()),
            completion_marker: Some("-- Dump completed".to_string()),
        }
    }

    /// `pg_dump` in plain format.
    ///
    /// pg_dump always reads from one snapshot, so both modes map to the same call.
    pub fn pg_dump() -> Self {
        Self {
            program: "pg_dump".to_string(),
            args: vec!["--format=plain".to_string(), "{database}".to_string()],
            single_transaction_args: Vec::new(),
            lock_tables_args: Vec::new(),
            password: None,
            password_env: Some("PGPASSWORD".to_string()),
            completion_marker: Some("-- PostgreSQL database dump complete".to_string()),
        }
    }

    fn argv(&self, database: &str, mode: ConsistencyMode) -> Vec<String> {
        let consistency = match mode {
            ConsistencyMode::SingleTransaction => &self.single_transaction_args,
            ConsistencyMode::LockTables => &self.lock_tables_args,
        };
        consistency
            .iter()
            .chain(self.args.iter())
            .map(|arg| arg.replace("{database}", database))
            .collect()
    }
}

impl Default for CommandSourceConfig {
    fn default() -> Self {
        Self::mysqldump()
    }
}

/// Runs an external dump tool and streams its stdout
pub struct CommandSnapshotSource {
    config: CommandSourceConfig,
    password: Option<Secret>,
}

impl CommandSnapshotSource {
    /// `password` is handed to the child through `config.password_env`, never argv.
    pub fn new(config: CommandSourceConfig, password: Option<Secret>) -> Result<Self> {
        if config.program.is_empty() {
            return Err(BackupError::validation("snapshot command cannot be empty"));
        }
        if password.is_some() && config.password_env.is_none() {
            return Err(BackupError::validation(
                "a password was supplied but no password_env names where the tool reads it",
            ));
        }
        Ok(Self { config, password })
    }

    pub fn config(&self) -> &CommandSourceConfig {
        &self.config
    }
}

impl SnapshotSource for CommandSnapshotSource {
    fn name(&self) -> &str {
        &self.config.program
    }

    fn take_snapshot(
        &self,
        database: &str,
        mode: ConsistencyMode,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let argv = self.config.argv(database, mode);
        let mut command = Command::new(&self.config.program);
        command
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let (Some(password), Some(var)) = (&self.password, &self.config.password_env) {
            command.env(var, password.expose());
        }

        let mut child = command.spawn().map_err(|e| {
            BackupError::source_error(format!("failed to start {}: {e}", self.config.program))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BackupError::source_error(format!("{} has no stdout pipe", self.config.program))
        })?;
        let stderr = child.stderr.take();
        info!(
            program = %self.config.program,
            database = %database,
            mode = %mode,
            pid = child.id(),
            "started dump process"
        );

        let stderr_tail = stderr.map(|mut pipe| {
            thread::spawn(move || {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_BYTES);
                let mut buffer = [0u8; 1024];
                loop {
                    match pipe.read(&mut buffer) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            tail.extend(&buffer[..n]);
                            while tail.len() > STDERR_TAIL_BYTES {
                                tail.pop_front();
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&tail.into_iter().collect::<Vec<u8>>())
                    .trim()
                    .to_string()
            })
        });

        let child = Arc::new(Mutex::new(child));
        let released = cancel.child_token();
        let finished = Arc::new(AtomicBool::new(false));
        {
            let child = Arc::clone(&child);
            let released = released.clone();
            let finished = Arc::clone(&finished);
            let parent = cancel.clone();
            thread::spawn(move || {
                futures::executor::block_on(released.cancelled());
                if parent.is_cancelled() && !finished.load(Ordering::SeqCst) {
                    if let Ok(mut child) = child.lock() {
                        warn!(pid = child.id(), "cancelling dump process");
                        let _ = child.kill();
                    }
                }
            });
        }

        Ok(Box::new(CommandStream {
            program: self.config.program.clone(),
            child,
            stdout,
            stderr_tail,
            marker: self.config.completion_marker.clone(),
            tail: Vec::new(),
            cancel: cancel.clone(),
            released,
            finished,
            done: false,
        }))
    }
}

struct CommandStream {
    program: String,
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    stderr_tail: Option<JoinHandle<String>>,
    marker: Option<String>,
    /// Last bytes of output, for the completion marker check
    tail: Vec<u8>,
    cancel: CancellationToken,
    /// Cancelled when the stream is done so the watcher thread exits
    released: CancellationToken,
    finished: Arc<AtomicBool>,
    done: bool,
}

impl CommandStream {
    fn fault(&self, msg: String) -> io::Error {
        SourceFault(msg).into_io()
    }

    fn remember_tail(&mut self, data: &[u8]) {
        let Some(marker) = &self.marker else {
            return;
        };
        let window = marker.len() + MARKER_SLACK_BYTES;
        self.tail.extend_from_slice(data);
        if self.tail.len() > window {
            let excess = self.tail.len() - window;
            self.tail.drain(..excess);
        }
    }

    /// Reconcile end of output with the process outcome
    fn finish(&mut self) -> io::Result<()> {
        self.done = true;
        // poll so that a concurrent cancel can still take the lock and kill
        let status = loop {
            let polled = self
                .child
                .lock()
                .map_err(|_| self.fault(format!("{} handle poisoned", self.program)))?
                .try_wait()
                .map_err(|e| self.fault(format!("failed to reap {}: {e}", self.program)))?;
            match polled {
                Some(status) => break status,
                None => thread::sleep(REAP_POLL_INTERVAL),
            }
        };
        self.finished.store(true, Ordering::SeqCst);
        self.released.cancel();
        let stderr = self
            .stderr_tail
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if self.cancel.is_cancelled() {
            return Err(self.fault(format!("{} was cancelled", self.program)));
        }
        if !status.success() {
            return Err(self.fault(format!(
                "{} exited with {status}: {}",
                self.program,
                if stderr.is_empty() { "no diagnostics" } else { &stderr }
            )));
        }
        if let Some(marker) = &self.marker {
            let tail = String::from_utf8_lossy(&self.tail);
            if !tail.contains(marker.as_str()) {
                return Err(self.fault(format!(
                    "{} output ended without completion marker '{marker}'",
                    self.program
                )));
            }
        }
        debug!(program = %self.program, "dump process completed");
        Ok(())
    }
}

impl Read for CommandStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        match self.stdout.read(buf) {
            Ok(0) => self.finish().map(|_| 0),
            Ok(n) => {
                self.remember_tail(&buf[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => Err(self.fault(format!("reading {} output failed: {e}", self.program))),
        }
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if !self.done {
            if let Ok(mut child) = self.child.lock() {
                debug!(program = %self.program, "stream dropped early, stopping dump process");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        self.finished.store(true, Ordering::SeqCst);
        self.released.cancel();
    }
}

/// Cancels a token once a timeout elapses.
///
/// Dropping the deadline stops its timer thread without cancelling.
pub struct SnapshotDeadline {
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
    _stop: Option<mpsc::Sender<()>>,
}

impl SnapshotDeadline {
    pub fn start(token: CancellationToken, timeout: Option<Duration>) -> Self {
        let timed_out = Arc::new(AtomicBool::new(false));
        let stop = timeout.map(|timeout| {
            let (tx, rx) = mpsc::channel::<()>();
            let token = token.clone();
            let timed_out = Arc::clone(&timed_out);
            thread::spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                    timed_out.store(true, Ordering::SeqCst);
                    token.cancel();
                }
            });
            tx
        });
        Self {
            token,
            timed_out,
            _stop: stop,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Wrap a snapshot stream so reads fail with a [`SourceFault`] once cancelled
    pub fn guard(&self, inner: ByteStream) -> ByteStream {
        Box::new(CancellableReader {
            inner,
            token: self.token.clone(),
            timed_out: Arc::clone(&self.timed_out),
        })
    }
}

/// Checks for cancellation between reads
pub struct CancellableReader {
    inner: ByteStream,
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
}

impl CancellableReader {
    fn check(&self) -> io::Result<()> {
        if !self.token.is_cancelled() {
            return Ok(());
        }
        let reason = if self.timed_out.load(Ordering::SeqCst) {
            "snapshot exceeded its timeout"
        } else {
            "snapshot was cancelled"
        };
        Err(SourceFault(reason.to_string()).into_io())
    }
}

impl Read for CancellableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        let result = self.inner.read(buf);
        // the inner error of a killed dump is less useful than the reason it was killed
        self.check()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn shell(script: &str, marker: Option<&str>) -> CommandSnapshotSource {
        CommandSnapshotSource::new(
            CommandSourceConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string(), "sh".to_string(), "{database}".to_string()],
                single_transaction_args: Vec::new(),
                lock_tables_args: Vec::new(),
                password: None,
                password_env: Some("BACKSTOP_TEST_PW".to_string()),
                completion_marker: marker.map(str::to_string),
            },
            Some(Secret::new("hunter2")),
        )
        .unwrap()
    }

    fn drain(stream: ByteStream) -> std::result::Result<Vec<u8>, BackupError> {
        let mut stream = stream;
        let mut out = Vec::new();
        stream
            .read_to_end(&mut out)
            .map_err(BackupError::from_stream_error)?;
        Ok(out)
    }

    #[test]
    fn test_argv_substitutes_database_and_mode() {
        let config = CommandSourceConfig::mysqldump();
        assert_eq!(
            config.argv("orders", ConsistencyMode::SingleTransaction),
            vec!["--single-transaction", "--routines", "--triggers", "--events", "orders"]
        );
        assert_eq!(
            config.argv("orders", ConsistencyMode::LockTables)[0],
            "--lock-tables"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_complete_dump_streams_output() {
        let source = shell(
            r#"echo "CREATE DATABASE $1;"; echo "-- pw=$BACKSTOP_TEST_PW"; echo "-- Dump completed""#,
            Some("-- Dump completed"),
        );
        let token = CancellationToken::new();
        let output = drain(
            source
                .take_snapshot("orders", ConsistencyMode::SingleTransaction, &token)
                .unwrap(),
        )
        .unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("CREATE DATABASE orders;"));
        assert!(text.contains("pw=hunter2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_source_error() {
        let source = shell("echo partial; echo 'access denied' >&2; exit 2", None);
        let token = CancellationToken::new();
        let err = drain(
            source
                .take_snapshot("orders", ConsistencyMode::SingleTransaction, &token)
                .unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Source(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_marker_is_truncation() {
        let source = shell("echo 'INSERT INTO t VALUES (1);'", Some("-- Dump completed"));
        let token = CancellationToken::new();
        let err = drain(
            source
                .take_snapshot("orders", ConsistencyMode::SingleTransaction, &token)
                .unwrap(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("completion marker"));
    }

    #[cfg(unix)]
    #[test]
    fn test_deadline_kills_stalled_dump() {
        let source = shell("echo start; exec sleep 30", Some("-- Dump completed"));
        let deadline = SnapshotDeadline::start(CancellationToken::new(), Some(Duration::from_millis(200)));
        let stream = source
            .take_snapshot("orders", ConsistencyMode::SingleTransaction, deadline.token())
            .unwrap();

        let started = std::time::Instant::now();
        let err = drain(deadline.guard(stream)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(deadline.timed_out());
        assert!(matches!(err, BackupError::Source(_)));
    }

    #[test]
    fn test_missing_program_fails_to_start() {
        let source = CommandSnapshotSource::new(
            CommandSourceConfig {
                program: "backstop-definitely-not-installed".to_string(),
                ..CommandSourceConfig::mysqldump()
            },
            None,
        )
        .unwrap();
        let result = source.take_snapshot("orders", ConsistencyMode::LockTables, &CancellationToken::new());
        assert!(matches!(result, Err(BackupError::Source(_))));
    }

    #[test]
    fn test_password_requires_env_var() {
        let config = CommandSourceConfig {
            password_env: None,
            ..CommandSourceConfig::pg_dump()
        };
        assert!(CommandSnapshotSource::new(config, Some(Secret::new("pw"))).is_err());
    }

    #[test]
    fn test_cancelled_reader_reports_source_fault() {
        let token = CancellationToken::new();
        let deadline = SnapshotDeadline::start(token.clone(), None);
        let mut reader = deadline.guard(Box::new(Cursor::new(vec![1u8; 16])));

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        token.cancel();
        let err = BackupError::from_stream_error(reader.read(&mut buf).unwrap_err());
        assert!(matches!(err, BackupError::Source(msg) if msg.contains("cancelled")));
        assert!(!deadline.timed_out());
    }
}
