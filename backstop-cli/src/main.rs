/*!
Backstop CLI - trigger backup runs and inspect what they produced.

`backstop run` and `backstop resync` exit with the run's status code: 0 for
Success, 1 for Failure (including a run that could not start), 2 for
PartialFailure.
*/

use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use backstop_core::observability::init_observability_with_directive;
use backstop_core::{
    AlertSink, Artifact, ArtifactNamer, BackstopConfig, BackupError, BackupOrchestrator,
    BackupRun, ConsistencyMode, EnvCredentialProvider, JsonLinesAlertSink, LocalStore,
    RemoteStore, RetentionWindow, TracingAlertSink, TransformPipeline, Trigger,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "/etc/backstop/backstop.json";

#[derive(Parser)]
#[command(name = "backstop")]
#[command(about = "Consistent database backups with verified local and off-site retention")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "BACKSTOP_JSON_LOGS")]
    json_logs: bool,

    /// Configuration file (JSON)
    #[arg(short, long, global = true, env = "BACKSTOP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the local artifact directory
    #[arg(long, global = true, env = "BACKSTOP_LOCAL_ROOT")]
    local_root: Option<PathBuf>,

    /// Write Prometheus metrics here after the command (textfile collector format)
    #[arg(long, global = true, env = "BACKSTOP_METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    /// Append failure events as JSON lines to this file
    #[arg(long, global = true, env = "BACKSTOP_ALERT_LOG")]
    alert_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a snapshot and run the full backup lifecycle once
    Run(TriggerArgs),
    /// Retry remote sync and pruning for existing artifacts
    Resync(TriggerArgs),
    /// List artifacts on the local tier and on remote tiers
    List {
        /// Only show artifacts of this database
        #[arg(short, long)]
        database: Option<String>,
        /// Remote tiers to include (default: all configured)
        #[arg(short, long = "remote")]
        remotes: Vec<String>,
        /// Skip remote tiers
        #[arg(long)]
        local_only: bool,
    },
    /// Re-read a local artifact and check it against its recorded checksum
    Verify {
        /// Artifact key
        key: String,
    },
    /// Decrypt and decompress a local artifact into a plain SQL file
    Unpack {
        /// Artifact key
        key: String,
        /// Destination file
        output: PathBuf,
        /// Overwrite the destination if it exists
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct TriggerArgs {
    /// Database identifier
    #[arg(env = "BACKSTOP_DATABASE")]
    database: String,

    /// How the snapshot obtains a consistent view
    #[arg(long, value_enum, default_value = "single-transaction", env = "BACKSTOP_CONSISTENCY_MODE")]
    mode: Mode,

    /// Retention window in days
    #[arg(long, env = "BACKSTOP_RETENTION_DAYS")]
    retention_days: Option<i64>,

    /// Artifacts that survive retention regardless of age
    #[arg(long, env = "BACKSTOP_MINIMUM_KEEP")]
    minimum_keep: Option<usize>,

    /// Remote tiers to mirror to (default: all configured)
    #[arg(short, long = "remote")]
    remotes: Vec<String>,

    /// Do not touch remote tiers
    #[arg(long, conflicts_with = "remotes")]
    no_remotes: bool,

    /// Propagate retention to remote tiers
    #[arg(long, env = "BACKSTOP_AUTO_PRUNE")]
    auto_prune: bool,

    /// Abort the snapshot after this many seconds
    #[arg(long, env = "BACKSTOP_SNAPSHOT_TIMEOUT_SECS")]
    snapshot_timeout_secs: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    SingleTransaction,
    LockTables,
}

impl From<Mode> for ConsistencyMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::SingleTransaction => ConsistencyMode::SingleTransaction,
            Mode::LockTables => ConsistencyMode::LockTables,
        }
    }
}

#[derive(Tabled)]
struct ArtifactRow {
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
}

impl ArtifactRow {
    fn new(tier: &str, artifact: &Artifact) -> Self {
        Self {
            tier: tier.to_string(),
            key: artifact.key().to_string(),
            created: artifact.created_at().format("%Y-%m-%d %H:%M UTC").to_string(),
            size: format_size(artifact.size_bytes()),
            state: format!("{:?}", artifact.state()),
            checksum: artifact.checksum().chars().take(12).collect(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let directive = if cli.verbose { "backstop=debug" } else { "backstop=info" };
    if let Err(e) = init_observability_with_directive(cli.json_logs, directive) {
        eprintln!("failed to initialize logging: {e}");
    }

    let code = match execute(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            1
        }
    };

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = write_metrics(path) {
            warn!("failed to write metrics to {}: {e:#}", path.display());
        }
    }

    ExitCode::from(code)
}

fn execute(cli: &Cli) -> anyhow::Result<u8> {
    let mut config = load_config(cli)?;

    match &cli.command {
        Commands::Run(args) => {
            apply_trigger_overrides(&mut config, args);
            let trigger = build_trigger(&config, args)?;
            let orchestrator = build_orchestrator(cli, config)?;
            report_run(orchestrator.run_once(&trigger))
        }
        Commands::Resync(args) => {
            apply_trigger_overrides(&mut config, args);
            let trigger = build_trigger(&config, args)?;
            let orchestrator = build_orchestrator(cli, config)?;
            report_run(orchestrator.resync(&trigger))
        }
        Commands::List {
            database,
            remotes,
            local_only,
        } => list_artifacts(&config, database.as_deref(), remotes, *local_only),
        Commands::Verify { key } => verify_artifact(&config, key),
        Commands::Unpack { key, output, force } => unpack_artifact(&config, key, output, *force),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<BackstopConfig> {
    let mut config = match &cli.config {
        Some(path) => BackstopConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => BackstopConfig::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("loading configuration from {DEFAULT_CONFIG_PATH}"))?,
        None => {
            info!("no configuration file, using defaults");
            BackstopConfig::default()
        }
    };
    if let Some(root) = &cli.local_root {
        config.local.root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

fn apply_trigger_overrides(config: &mut BackstopConfig, args: &TriggerArgs) {
    if args.auto_prune {
        config.auto_prune = true;
    }
    if let Some(secs) = args.snapshot_timeout_secs {
        config.snapshot_timeout_secs = Some(secs);
    }
}

fn build_trigger(config: &BackstopConfig, args: &TriggerArgs) -> anyhow::Result<Trigger> {
    let retention = RetentionWindow::days(
        args.retention_days.unwrap_or(config.retention.days),
        args.minimum_keep.unwrap_or(config.retention.minimum_keep),
    )?;
    let targets = if args.no_remotes {
        Vec::new()
    } else if args.remotes.is_empty() {
        config.remote_names()
    } else {
        args.remotes.clone()
    };
    Ok(Trigger::new(
        args.database.as_str(),
        args.mode.into(),
        retention,
        targets,
    ))
}

fn build_orchestrator(cli: &Cli, config: BackstopConfig) -> anyhow::Result<BackupOrchestrator> {
    let alerts: Arc<dyn AlertSink> = match &cli.alert_log {
        Some(path) => Arc::new(
            JsonLinesAlertSink::open(path)
                .with_context(|| format!("opening alert log {}", path.display()))?,
        ),
        None => Arc::new(TracingAlertSink),
    };
    let orchestrator = BackupOrchestrator::from_config(config, &EnvCredentialProvider)?;
    Ok(orchestrator.with_alert_sink(alerts))
}

/// Print the run summary on stdout and map it to an exit code
fn report_run(outcome: backstop_core::Result<BackupRun>) -> anyhow::Result<u8> {
    match outcome {
        Ok(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(u8::try_from(run.exit_code()).unwrap_or(1))
        }
        Err(e @ BackupError::LockContention { .. }) => {
            eprintln!("✗ {e}");
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

fn list_artifacts(
    config: &BackstopConfig,
    database: Option<&str>,
    remotes: &[String],
    local_only: bool,
) -> anyhow::Result<u8> {
    let mut rows = Vec::new();

    let local = LocalStore::open(&config.local.root)?;
    for artifact in local.list()? {
        if database.map_or(true, |db| artifact.database() == db) {
            rows.push(ArtifactRow::new("local", &artifact));
        }
    }

    if !local_only {
        let names = if remotes.is_empty() {
            config.remote_names()
        } else {
            remotes.to_vec()
        };
        for name in names {
            let remote = config
                .remote(&name)
                .ok_or_else(|| anyhow!("unknown remote '{name}'"))?;
            let storage = remote.build(config.operation_timeout())?;
            let store = RemoteStore::new(storage).with_retry_policy(config.retry.clone());
            match store.inventory(database) {
                Ok(artifacts) => rows.extend(artifacts.iter().map(|a| ArtifactRow::new(&name, a))),
                Err(e) => warn!("failed to list remote '{name}': {e}"),
            }
        }
    }

    if rows.is_empty() {
        println!("No artifacts found");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(0)
}

fn verify_artifact(config: &BackstopConfig, key: &str) -> anyhow::Result<u8> {
    let store = LocalStore::open(&config.local.root)?;
    let mut artifact = store.get(key)?;
    if store.verify(&mut artifact)? {
        println!("✓ {key} matches its recorded checksum");
        Ok(0)
    } else {
        println!("✗ {key} does not match its recorded checksum {}", artifact.checksum());
        Ok(1)
    }
}

fn unpack_artifact(config: &BackstopConfig, key: &str, output: &Path, force: bool) -> anyhow::Result<u8> {
    let store = LocalStore::open(&config.local.root)?;
    let mut artifact = store.get(key)?;
    if !store.verify(&mut artifact)? {
        bail!("{key} failed verification, refusing to unpack");
    }
    let parsed = ArtifactNamer::parse(key).ok_or_else(|| anyhow!("'{key}' is not an artifact key"))?;
    let pipeline = TransformPipeline::for_extension(&parsed.extension, &config.transform, &EnvCredentialProvider)?;

    let stored = BufReader::new(store.open_artifact(key)?);
    let mut plain = pipeline.invert(Box::new(stored))?;

    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;
    let bytes = io::copy(&mut plain, &mut temp)
        .map_err(BackupError::from_stream_error)
        .with_context(|| format!("unpacking {key}"))?;
    temp.as_file().sync_all()?;

    if force {
        temp.persist(output)?;
    } else {
        temp.persist_noclobber(output)
            .map_err(|e| anyhow!("{} already exists (use --force): {}", output.display(), e.error))?;
    }
    println!("✓ unpacked {key} ({}) to {}", format_size(bytes), output.display());
    Ok(0)
}

#[cfg(feature = "metrics")]
fn write_metrics(path: &Path) -> anyhow::Result<()> {
    use std::io::Write;

    let text = backstop_core::observability::BackupMetrics::global().gather_metrics()?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(text.as_bytes())?;
    temp.persist(path)?;
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn write_metrics(_path: &Path) -> anyhow::Result<()> {
    bail!("this build does not include the metrics feature")
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
