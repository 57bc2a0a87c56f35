/*!
# Backstop Core Engine

Backup lifecycle engine for relational databases.

One run takes a consistent snapshot, streams it through compression and optional
encryption into a verified local artifact, mirrors verified artifacts to off-site
tiers and applies retention to every tier. Each run ends in exactly one of
`Success`, `PartialFailure` or `Failure`, with a result recorded for every step.

## Architecture

- [`source`]: snapshot sources (dump commands) behind the [`SnapshotSource`] port
- [`transform`]: streaming compression and encryption stages
- [`naming`]: deterministic artifact keys
- [`local_store`]: the local tier, with atomic persistence and read-back verification
- [`remote`] and [`storage`]: remote tiers and their object storage backends
- [`retention`]: the pure retention function
- [`orchestrator`]: the state machine tying the above together

## Usage

```rust,no_run
use std::sync::Arc;
use backstop_core::{BackstopConfig, BackupOrchestrator, EnvCredentialProvider, Trigger};

let config = BackstopConfig::load("/etc/backstop/backstop.json")?;
let orchestrator = BackupOrchestrator::from_config(config.clone(), &EnvCredentialProvider)?;

let run = orchestrator.run_once(&Trigger::from_config("orders", &config)?)?;
std::process::exit(run.exit_code());
# Ok::<(), backstop_core::BackupError>(())
```
*/

pub mod artifact;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod local_store;
pub mod lock;
pub mod naming;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod remote;
pub mod retention;
pub mod run;
pub mod source;
pub mod storage;
pub mod transform;

#[cfg(test)]
mod error_tests;

pub use artifact::{Artifact, ArtifactState, Tier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackstopConfig, RemoteBackend, RemoteConfig, S3Target};
pub use credentials::{CredentialHandle, CredentialProvider, EnvCredentialProvider, Secret, StaticCredentialProvider};
pub use error::{BackupError, ErrorKind, Result};
pub use local_store::LocalStore;
pub use naming::ArtifactNamer;
pub use notify::{AlertSink, FailureEvent, JsonLinesAlertSink, TracingAlertSink};
pub use orchestrator::{BackupOrchestrator, Trigger};
pub use remote::{PruneReport, RemoteStore, SyncReport};
pub use retention::{RetentionConfig, RetentionWindow};
pub use run::{BackupRun, RunStatus, Step, StepResult, StepStatus};
pub use source::{CommandSnapshotSource, CommandSourceConfig, ConsistencyMode, SnapshotSource};
pub use storage::{MemoryObjectStorage, ObjectStorage};
pub use transform::{TransformOptions, TransformPipeline};
