//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use cloud_storage_audit::backend::{self, BackendSet};
use cloud_storage_audit::core::config::{BackendKind, Config};
use cloud_storage_audit::core::errors::AuditError;
use cloud_storage_audit::inventory::audit::Auditor;
use cloud_storage_audit::logger::activity::{
    ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use cloud_storage_audit::logger::jsonl::JsonlConfig;
use cloud_storage_audit::progress::{ProgressHandle, spawn_reporter};
use cloud_storage_audit::report::{AuditSummary, CsvReportSink, ReportSink};

/// Cloud Storage Audit: sizes every bucket, disk and file share across projects.
#[derive(Debug, Parser)]
#[command(
    name = "csa",
    author,
    version,
    about = "Cloud Storage Audit - per-resource storage inventory",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Audit every selected project and write the CSV report.
    Audit(AuditArgs),
    /// List the projects an audit would scan.
    Projects(ProjectsArgs),
    /// View and validate configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct AuditArgs {
    /// Scan only these projects instead of listing them (repeatable).
    #[arg(long = "project", value_name = "ID")]
    projects: Vec<String>,
    /// Maximum probes in flight per project.
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,
    /// Probes that must finish before admission resumes at the ceiling.
    #[arg(long, value_name = "N")]
    release_batch: Option<usize>,
    /// Projects scanned at the same time.
    #[arg(long, value_name = "N")]
    project_parallelism: Option<usize>,
    /// CSV report path (default: storage_audit_<timestamp>.csv in the working directory).
    #[arg(long, value_name = "PATH")]
    csv: Option<PathBuf>,
    /// Answer every backend call from a fixture inventory document.
    #[arg(long, value_name = "PATH")]
    fixture: Option<PathBuf>,
    /// Do not render the live progress line.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Debug, Clone, Default, Args)]
struct ProjectsArgs {
    /// Answer the listing from a fixture inventory document.
    #[arg(long, value_name = "PATH")]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure: backend unreachable, nothing to scan, report unwritable.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<AuditError> for CliError {
    fn from(value: AuditError) -> Self {
        match value {
            AuditError::InvalidConfig { .. }
            | AuditError::MissingConfig { .. }
            | AuditError::ConfigParse { .. } => Self::User(value.to_string()),
            AuditError::Serialization { .. } => Self::Internal(value.to_string()),
            _ => Self::Runtime(value.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Audit(args) => run_audit(cli, args),
        Command::Projects(args) => run_projects(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Audit command
// ---------------------------------------------------------------------------

fn run_audit(cli: &Cli, args: &AuditArgs) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    apply_audit_overrides(&mut config, args);
    config.validate()?;

    let backends = backend::build(&config)?;
    let csv_path = args
        .csv
        .clone()
        .or_else(|| config.output.csv_path.clone())
        .unwrap_or_else(default_report_path);
    let mode = output_mode(cli);

    let (logger, logger_join) = start_logger(&config);
    let show_progress =
        config.output.progress && !args.no_progress && mode == OutputMode::Human;
    let reporter = if show_progress {
        match spawn_reporter() {
            Ok(pair) => Some(pair),
            Err(e) => {
                eprintln!("csa: progress display disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let progress = reporter.as_ref().map(|(handle, _)| handle.clone());
    let outcome = execute_audit(&config, backends, args, &csv_path, logger.clone(), progress);

    // The reporter thread finishes once its last handle is gone.
    if let Some((progress, join)) = reporter {
        drop(progress);
        let _ = join.join();
    }
    logger.shutdown();
    if let Some(join) = logger_join {
        let _ = join.join();
    }

    let summary = outcome?;
    match mode {
        OutputMode::Human => print_summary_human(&summary),
        OutputMode::Json => {
            let payload = json!({
                "command": "audit",
                "complete": summary.is_complete(),
                "summary": serde_json::to_value(&summary)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn execute_audit(
    config: &Config,
    backends: BackendSet,
    args: &AuditArgs,
    csv_path: &Path,
    logger: ActivityLoggerHandle,
    progress: Option<ProgressHandle>,
) -> Result<AuditSummary, AuditError> {
    let mut auditor = Auditor::from_config(config, backends)?.with_logger(logger);
    if !args.projects.is_empty() {
        auditor = auditor.with_projects(args.projects.clone());
    }
    if let Some(progress) = progress {
        auditor = auditor.with_progress(progress);
    }
    // Setup checks run before the report file is created or truncated.
    let projects = auditor.resolve_projects()?;
    let auditor = auditor.with_projects(projects);
    let sink = CsvReportSink::create(csv_path)?;
    let mut summary = auditor.run(&sink)?;
    sink.flush()?;
    summary.report_path = sink.path().map(Path::to_path_buf);
    Ok(summary)
}

fn apply_audit_overrides(config: &mut Config, args: &AuditArgs) {
    if let Some(limit) = args.concurrency {
        config.audit.concurrency_limit = limit;
        if args.release_batch.is_none() {
            config.audit.release_batch = 0;
        }
    }
    if let Some(batch) = args.release_batch {
        config.audit.release_batch = batch;
    }
    if let Some(parallelism) = args.project_parallelism {
        config.audit.project_parallelism = parallelism;
    }
    if let Some(fixture) = &args.fixture {
        use_fixture(config, fixture);
    }
}

fn use_fixture(config: &mut Config, fixture: &Path) {
    config.backend.kind = BackendKind::Fixture;
    config.backend.fixture_path = Some(fixture.to_path_buf());
}

fn default_report_path() -> PathBuf {
    PathBuf::from(format!(
        "storage_audit_{}.csv",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ))
}

fn start_logger(config: &Config) -> (ActivityLoggerHandle, Option<std::thread::JoinHandle<()>>) {
    let mut jsonl = JsonlConfig::new(&config.output.jsonl_log);
    jsonl.fallback_path.clone_from(&config.output.jsonl_fallback);
    match spawn_logger(ActivityLoggerConfig::new(jsonl)) {
        Ok((handle, join)) => (handle, Some(join)),
        Err(e) => {
            eprintln!("csa: activity log disabled: {e}");
            (ActivityLoggerHandle::disabled(), None)
        }
    }
}

fn print_summary_human(summary: &AuditSummary) {
    let heading = if summary.is_complete() {
        "Audit complete.".green().bold()
    } else {
        "Audit complete with errors.".yellow().bold()
    };
    println!("{heading}");
    print!("{}", summary.render_human());
}

// ---------------------------------------------------------------------------
// Projects command
// ---------------------------------------------------------------------------

fn run_projects(cli: &Cli, args: &ProjectsArgs) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(fixture) = &args.fixture {
        use_fixture(&mut config, fixture);
        config.validate()?;
    }
    let backends = backend::build(&config)?;
    let projects = Auditor::from_config(&config, backends)?.resolve_projects()?;

    match output_mode(cli) {
        OutputMode::Human => {
            for project in &projects {
                println!("{project}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "projects",
                "projects": projects,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config command
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "code": e.code(),
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CSA_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
