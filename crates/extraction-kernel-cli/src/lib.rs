//! Operator command surface for the extraction schema.
//!
//! [`run_cli`] executes a parsed [`Cli`]; `main` only maps failures to
//! `error[<kind>]: <message>` and a non-zero exit status.

mod config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use extraction_kernel_core::{
    extraction_revisions, validate_transition, AuditSeverity, Direction, ExtractionStatus,
    GraphError, MigrationError, MigrationTarget, PolicyError, Principal, RevisionGraph, TransitionError,
};
use extraction_kernel_store_sqlite::{default_holder, MigrateOptions, SqliteSchemaStore};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

pub use config::{CliOverrides, Config, ConfigError, LogFormat, DEFAULT_CONFIG_FILE};

#[derive(Debug, Parser)]
#[command(name = "ek")]
#[command(about = "Extraction schema migrator and policy inspector")]
pub struct Cli {
    /// SQLite database file; overrides `EK_DB` and the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Install the principal-identity source on the migrator connection.
    #[arg(long, global = true)]
    trust_boundary: bool,

    #[arg(long, global = true)]
    lock_wait_ms: Option<u64>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    Status {
        #[command(subcommand)]
        command: StatusCommand,
    },
    Docs {
        #[command(subcommand)]
        command: DocsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Apply revisions up to `--to` (default: head). Never moves backwards.
    Up(UpArgs),
    /// Reverse revisions down to `--to` (a revision id or `base`). Never moves forwards.
    Down(DownArgs),
    Current,
    History,
    Heads,
    /// Show the walk to `--to` without executing it.
    Plan(PlanArgs),
    /// Audit the revision set for unsafe migrations.
    Check,
    /// Clear a lock left behind by a migrator that died.
    Unlock(UnlockArgs),
}

#[derive(Debug, Args)]
pub struct UpArgs {
    #[arg(long, default_value = "head")]
    to: String,
}

#[derive(Debug, Args)]
pub struct DownArgs {
    #[arg(long)]
    to: String,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[arg(long, default_value = "head")]
    to: String,
}

#[derive(Debug, Args)]
pub struct UnlockArgs {
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// List protected tables and their ownership policies.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum StatusCommand {
    /// Check whether `FROM -> TO` is an allowed extraction status change.
    Validate(ValidateArgs),
    /// Print the extraction status state machine.
    Graph,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    from: String,
    to: String,
}

#[derive(Debug, Subcommand)]
pub enum DocsCommand {
    /// Fail when documentation instructs operators to reverse revisions.
    Check(DocsCheckArgs),
}

#[derive(Debug, Args)]
pub struct DocsCheckArgs {
    #[arg(long)]
    root: Option<PathBuf>,
}

/// Command-level failures that are not part of the domain taxonomy.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CliError {
    #[error("revision audit found {errors} error(s)")]
    AuditFailed { errors: usize },
    #[error("{count} documentation file(s) contain forbidden phrases")]
    DocsViolation { count: usize },
    #[error("migration lock is held by {holder}; pass --force to clear it")]
    UnlockRequiresForce { holder: String },
}

impl CliError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuditFailed { .. } => "audit_failed",
            Self::DocsViolation { .. } => "docs_violation",
            Self::UnlockRequiresForce { .. } => "lock_held",
        }
    }
}

/// Stable machine kind for any error `run_cli` returns.
#[must_use]
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    if let Some(err) = err.downcast_ref::<MigrationError>() {
        return err.kind();
    }
    if let Some(err) = err.downcast_ref::<GraphError>() {
        return err.kind();
    }
    if let Some(err) = err.downcast_ref::<TransitionError>() {
        return err.kind();
    }
    if let Some(err) = err.downcast_ref::<PolicyError>() {
        return err.kind();
    }
    if let Some(err) = err.downcast_ref::<ConfigError>() {
        return err.kind();
    }
    if let Some(err) = err.downcast_ref::<CliError>() {
        return err.kind();
    }
    "error"
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let overrides = CliOverrides {
        db: cli.db.clone(),
        trust_boundary: cli.trust_boundary.then_some(true),
        lock_wait_ms: cli.lock_wait_ms,
        log_level: cli.log_level.clone(),
        log_format: cli.log_format,
    };
    let config = Config::load(cli.config.as_deref(), &overrides)?;
    init_logging(&config);

    match cli.command {
        Command::Migrate { command } => run_migrate(command, &config),
        Command::Policy { command } => run_policy(&command, &config),
        Command::Status { command } => run_status(command),
        Command::Docs { command } => run_docs(command, &config),
    }
}

/// `RUST_LOG` wins over the configured level. Output goes to stderr so stdout
/// stays machine-readable.
pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match config.logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn open_store(config: &Config) -> Result<SqliteSchemaStore> {
    let store = SqliteSchemaStore::open_with_busy_timeout(
        &config.database.path,
        config.database.busy_timeout_ms,
    )?;
    if config.auth.trust_boundary {
        store
            .install_principal_source(&Principal::Service)
            .context("failed to install principal-identity source")?;
    }
    Ok(store)
}

fn revision_graph() -> Result<RevisionGraph> {
    Ok(RevisionGraph::new(extraction_revisions())?)
}

fn migrate_options(config: &Config, direction: Direction) -> MigrateOptions {
    MigrateOptions {
        holder: config
            .migrate
            .holder
            .clone()
            .unwrap_or_else(default_holder),
        lock_wait: Duration::from_millis(config.migrate.lock_wait_ms),
        cancel: None,
        direction: Some(direction),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_migrate(command: MigrateCommand, config: &Config) -> Result<()> {
    let graph = revision_graph()?;

    match command {
        MigrateCommand::Up(args) => {
            let store = open_store(config)?;
            let report = store.migrate(
                &graph,
                &MigrationTarget::parse(&args.to),
                &migrate_options(config, Direction::Up),
            )?;
            print_json(&report)
        }
        MigrateCommand::Down(args) => {
            let store = open_store(config)?;
            let report = store.migrate(
                &graph,
                &MigrationTarget::parse(&args.to),
                &migrate_options(config, Direction::Down),
            )?;
            print_json(&report)
        }
        MigrateCommand::Current => {
            let store = open_store(config)?;
            let head = store.current_head()?;
            let is_head = match (&head, graph.head()) {
                (Some(applied), Ok(latest)) => *applied == latest.id,
                _ => false,
            };
            print_json(&json!({
                "head": head,
                "is_latest": is_head,
                "lock": store.lock_status()?,
            }))
        }
        MigrateCommand::History => {
            let store = open_store(config)?;
            print_json(&store.history()?)
        }
        MigrateCommand::Heads => {
            let heads: Vec<_> = graph
                .heads()
                .into_iter()
                .map(|revision| {
                    json!({
                        "revision": revision.id,
                        "message": revision.message,
                        "branch_label": revision.branch_label,
                    })
                })
                .collect();
            print_json(&heads)
        }
        MigrateCommand::Plan(args) => {
            let store = open_store(config)?;
            let path = store.plan(&graph, &MigrationTarget::parse(&args.to))?;
            let nodes: Vec<_> = path
                .iter()
                .map(|step| {
                    json!({
                        "revision": step.revision.id,
                        "direction": step.direction,
                        "message": step.revision.message,
                        "head_after": step.head_after(),
                        "steps": step
                            .revision
                            .steps(step.direction)
                            .iter()
                            .map(extraction_kernel_core::Step::describe)
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
            print_json(&json!({
                "from": store.current_head()?,
                "to": args.to,
                "nodes": nodes,
            }))
        }
        MigrateCommand::Check => {
            let findings = graph.audit();
            let errors = findings
                .iter()
                .filter(|finding| finding.severity == AuditSeverity::Error)
                .count();
            print_json(&json!({
                "revisions": graph.len(),
                "head": graph.head()?.id,
                "findings": findings,
            }))?;
            if errors > 0 {
                return Err(CliError::AuditFailed { errors }.into());
            }
            Ok(())
        }
        MigrateCommand::Unlock(args) => {
            let store = open_store(config)?;
            match store.lock_status()? {
                None => print_json(&json!({ "released": null })),
                Some(lock) if !args.force => {
                    Err(CliError::UnlockRequiresForce { holder: lock.holder }.into())
                }
                Some(_) => print_json(&json!({ "released": store.force_unlock()? })),
            }
        }
    }
}

fn run_policy(command: &PolicyCommand, config: &Config) -> Result<()> {
    match command {
        PolicyCommand::Status => {
            let store = open_store(config)?;
            print_json(&json!({
                "principal_source": store.has_principal_source(),
                "protected_tables": store.policy_engine().status()?,
            }))
        }
    }
}

fn parse_status(label: &str) -> Result<ExtractionStatus, TransitionError> {
    ExtractionStatus::parse_stored(label).ok_or_else(|| TransitionError::UnknownStatus {
        label: label.to_string(),
    })
}

fn run_status(command: StatusCommand) -> Result<()> {
    match command {
        StatusCommand::Validate(args) => {
            let from = parse_status(&args.from)?;
            let to = parse_status(&args.to)?;
            validate_transition(from, to)?;
            print_json(&json!({ "from": from, "to": to, "legal": true }))
        }
        StatusCommand::Graph => {
            let states: Vec<_> = ExtractionStatus::ALL
                .into_iter()
                .map(|status| {
                    json!({
                        "status": status,
                        "terminal": status.is_terminal(),
                        "successors": status.successors(),
                    })
                })
                .collect();
            print_json(&json!({
                "initial": ExtractionStatus::INITIAL,
                "failure_catch_all": ExtractionStatus::Failed,
                "states": states,
            }))
        }
    }
}

#[derive(Debug, Serialize)]
struct DocsViolation {
    file: PathBuf,
    line: usize,
    phrase: String,
}

fn run_docs(command: DocsCommand, config: &Config) -> Result<()> {
    match command {
        DocsCommand::Check(args) => {
            let root = args.root.unwrap_or_else(|| config.docs.root.clone());
            let files = markdown_files(&root)?;
            let mut violations = Vec::new();
            for file in &files {
                let contents = std::fs::read_to_string(file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                violations.extend(scan_markdown(file, &contents, &config.docs.forbidden));
            }

            let offending: std::collections::BTreeSet<&Path> =
                violations.iter().map(|violation| violation.file.as_path()).collect();
            let count = offending.len();
            print_json(&json!({
                "root": root,
                "scanned": files.len(),
                "violations": violations,
            }))?;
            for violation in &violations {
                tracing::warn!(
                    file = %violation.file.display(),
                    line = violation.line,
                    phrase = %violation.phrase,
                    "documentation instructs a schema reversal"
                );
            }
            if count > 0 {
                return Err(CliError::DocsViolation { count }.into());
            }
            Ok(())
        }
    }
}

/// `*.md` files below `root`, sorted. A missing root yields nothing.
fn markdown_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        tracing::debug!(root = %root.display(), "docs root absent; nothing to check");
        return Ok(Vec::new());
    }
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut pending = vec![root.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("md")) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn scan_markdown(file: &Path, contents: &str, forbidden: &[String]) -> Vec<DocsViolation> {
    let phrases: Vec<(String, &String)> = forbidden
        .iter()
        .filter(|phrase| !phrase.trim().is_empty())
        .map(|phrase| (phrase.to_lowercase(), phrase))
        .collect();

    let mut violations = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let lowered = line.to_lowercase();
        for (needle, phrase) in &phrases {
            if lowered.contains(needle.as_str()) {
                violations.push(DocsViolation {
                    file: file.to_path_buf(),
                    line: index + 1,
                    phrase: (*phrase).clone(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn scan_reports_each_forbidden_line_case_insensitively() {
        let forbidden = vec!["migrate down".to_string(), "alembic downgrade".to_string()];
        let contents = "# Rollback\n\nRun `ek MIGRATE DOWN --to base`.\nNever `alembic downgrade -1`.\nfine\n";
        let violations = scan_markdown(Path::new("ops.md"), contents, &forbidden);
        let lines: Vec<usize> = violations.iter().map(|violation| violation.line).collect();
        assert_eq!(lines, vec![3, 4]);
        assert_eq!(violations[0].phrase, "migrate down");
    }

    #[test]
    fn error_kinds_come_from_the_domain_taxonomy() {
        let err = anyhow::Error::from(MigrationError::LockHeld {
            holder: "deploy-bot".to_string(),
        });
        assert_eq!(error_kind(&err), "lock_held");

        let err = anyhow::Error::from(TransitionError::UnknownStatus {
            label: "DONE".to_string(),
        });
        assert_eq!(error_kind(&err), "unknown_status");

        let err = anyhow::anyhow!("plain failure");
        assert_eq!(error_kind(&err), "error");
    }

    #[test]
    fn legacy_status_labels_are_accepted_for_validation() {
        assert_eq!(
            parse_status("OCR_PROCESSING"),
            Ok(ExtractionStatus::OcrInProgress)
        );
        assert!(parse_status("DONE").is_err());
    }
}
