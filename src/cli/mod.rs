//! Command-line interface for the release engine.
//!
//! Provides commands for preparing a patch release, advancing and resuming
//! runs, inspecting status, cancelling, and showing the resolved configuration.
//!
//! Exit codes: 0 on success, 1 when the run ended in failure, 2 on invalid
//! invocation (including an unknown run id).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{GitRepository, HttpGateway};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    release_checklist, LedgerStore, Orchestrator, OrchestratorError, ReleaseExecutor, RunStore,
    StoreError,
};
use crate::domain::{ReleaseManifest, ReleaseRun, ReleaseVersion, RunStatus};

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;

/// release - resumable patch-release orchestrator
#[derive(Parser, Debug)]
#[command(name = "release")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prepare a patch release and start executing its checklist
    Prepare {
        /// Version to release (e.g. 0.19.4)
        version: ReleaseVersion,

        /// Version being patched (defaults to the previous patch)
        #[arg(long)]
        previous: Option<ReleaseVersion>,

        /// Release branch (defaults to the configured branch pattern)
        #[arg(long)]
        branch: Option<String>,

        /// Commit to cherry-pick onto the release (repeatable)
        #[arg(long = "cherry-pick", value_name = "COMMIT")]
        cherry_picks: Vec<String>,

        /// Release description
        #[arg(long, conflicts_with = "description_file")]
        description: Option<String>,

        /// Read the release description from a file
        #[arg(long)]
        description_file: Option<PathBuf>,

        /// Release date (defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Only create the run; do not execute any step
        #[arg(long)]
        no_advance: bool,
    },

    /// Execute every ready step of a run
    Advance {
        /// Run ID (UUID)
        run_id: Uuid,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: Uuid,
    },

    /// Cancel a run; steps that have not finished are skipped
    Cancel {
        /// Run ID (UUID)
        run_id: Uuid,
    },

    /// Resume an interrupted run
    Resume {
        /// Run ID (UUID)
        run_id: Uuid,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Prepare {
                version,
                previous,
                branch,
                cherry_picks,
                description,
                description_file,
                date,
                no_advance,
            } => {
                let description = match description_file {
                    Some(path) => Some(
                        std::fs::read_to_string(&path).with_context(|| {
                            format!("Failed to read description file: {}", path.display())
                        })?,
                    ),
                    None => description,
                };
                let request = PrepareRequest {
                    version,
                    previous,
                    branch,
                    cherry_picks,
                    description,
                    date,
                };
                prepare(request, no_advance).await
            }
            Commands::Advance { run_id } => advance_run(run_id).await,
            Commands::Status { run_id } => show_status(run_id).await,
            Commands::Cancel { run_id } => cancel_run(run_id).await,
            Commands::Resume { run_id } => resume_run(run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config(),
        }
    }
}

struct PrepareRequest {
    version: ReleaseVersion,
    previous: Option<ReleaseVersion>,
    branch: Option<String>,
    cherry_picks: Vec<String>,
    description: Option<String>,
    date: Option<NaiveDate>,
}

/// Wire the orchestrator for `manifest` from configuration
fn build_orchestrator(cfg: &ResolvedConfig, manifest: &ReleaseManifest) -> Result<Orchestrator> {
    let graph = release_checklist(manifest, &cfg.checklist_settings())
        .context("Failed to build release checklist")?;
    let store = RunStore::new(cfg.runs_dir());

    let repo = Arc::new(GitRepository::new(
        cfg.repository.path.clone(),
        cfg.repository.remote.clone(),
    ));
    let mut executor = ReleaseExecutor::new(repo, LedgerStore::new(cfg.ledger_path()))
        .with_run_store(store.clone())
        .with_poll_policy(cfg.publish.poll.clone());

    if let Some(ref base_url) = cfg.publish.ci_base_url {
        let gateway = HttpGateway::new(
            base_url.clone(),
            cfg.publish.token.clone(),
            cfg.publish.workflows.clone(),
        );
        executor = executor.with_gateway(Arc::new(gateway));
    }

    Ok(Orchestrator::new(graph, store, Arc::new(executor)).with_options(cfg.execution.clone()))
}

/// Load a run; `None` if no run has this id
async fn load_run(store: &RunStore, run_id: Uuid) -> Result<Option<ReleaseRun>> {
    match store.load(run_id).await {
        Ok(run) => Ok(Some(run)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to load run {}", run_id)),
    }
}

/// Orchestrator for an existing run; `None` (after reporting it) if unknown
async fn orchestrator_for(run_id: Uuid) -> Result<Option<(Orchestrator, ReleaseRun)>> {
    let cfg = config::config()?;
    let Some(run) = load_run(&RunStore::new(cfg.runs_dir()), run_id).await? else {
        eprintln!("Error: no run with id {}", run_id);
        return Ok(None);
    };
    let orchestrator = build_orchestrator(cfg, &run.manifest)?;
    Ok(Some((orchestrator, run)))
}

/// Prepare a new release run
async fn prepare(request: PrepareRequest, no_advance: bool) -> Result<ExitCode> {
    let cfg = config::config()?;

    let previous = match request.previous.or_else(|| request.version.previous_patch()) {
        Some(previous) => previous,
        None => {
            eprintln!(
                "Error: {} is not a patch release; pass --previous explicitly",
                request.version
            );
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    };

    let branch = request
        .branch
        .unwrap_or_else(|| cfg.repository.release_branch(&request.version));
    let date = request.date.unwrap_or_else(|| Local::now().date_naive());

    let mut manifest = ReleaseManifest::new(request.version, previous, branch, date)
        .with_cherry_picks(request.cherry_picks);
    if let Some(description) = request.description {
        manifest = manifest.with_description(description);
    }

    let orchestrator = build_orchestrator(cfg, &manifest)?;
    let mut run = match orchestrator.start(manifest).await {
        Ok(run) => run,
        Err(OrchestratorError::ActiveRunExists { branch, run_id }) => {
            eprintln!(
                "Error: run {} is still in progress for branch '{}'; resume or cancel it first",
                run_id, branch
            );
            return Ok(ExitCode::from(EXIT_FAILURE));
        }
        Err(e) => return Err(e.into()),
    };

    eprintln!("Prepared run {}", run.run_id);
    if !no_advance {
        orchestrator.advance(&mut run).await?;
    }

    print_run(&orchestrator, &run);
    Ok(exit_code(&run))
}

/// Execute ready steps of an existing run
async fn advance_run(run_id: Uuid) -> Result<ExitCode> {
    let Some((orchestrator, mut run)) = orchestrator_for(run_id).await? else {
        return Ok(ExitCode::from(EXIT_USAGE));
    };
    orchestrator.advance(&mut run).await?;

    print_run(&orchestrator, &run);
    Ok(exit_code(&run))
}

/// Show the status of a run
async fn show_status(run_id: Uuid) -> Result<ExitCode> {
    let Some((orchestrator, _)) = orchestrator_for(run_id).await? else {
        return Ok(ExitCode::from(EXIT_USAGE));
    };
    let run = orchestrator.status(run_id).await?;

    print_run(&orchestrator, &run);
    Ok(exit_code(&run))
}

/// Cancel a run
async fn cancel_run(run_id: Uuid) -> Result<ExitCode> {
    let Some((orchestrator, _)) = orchestrator_for(run_id).await? else {
        return Ok(ExitCode::from(EXIT_USAGE));
    };
    let run = orchestrator.cancel(run_id).await?;

    if run.overall_status == RunStatus::Cancelled {
        eprintln!("[Run {} cancelled]", run.run_id);
    } else {
        eprintln!("[Run {} already {}]", run.run_id, run.overall_status);
    }
    print_run(&orchestrator, &run);
    Ok(ExitCode::SUCCESS)
}

/// Resume an interrupted run
async fn resume_run(run_id: Uuid) -> Result<ExitCode> {
    let Some((orchestrator, _)) = orchestrator_for(run_id).await? else {
        return Ok(ExitCode::from(EXIT_USAGE));
    };
    let run = orchestrator.resume(run_id).await?;

    print_run(&orchestrator, &run);
    Ok(exit_code(&run))
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<ExitCode> {
    let cfg = config::config()?;
    let store = RunStore::new(cfg.runs_dir());

    let runs = store.load_recent(Some(limit)).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<38} {:<10} {:<16} {:<12} {:<20}",
        "RUN ID", "VERSION", "BRANCH", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(98));

    for run in runs {
        println!(
            "{:<38} {:<10} {:<16} {:<12} {:<20}",
            run.run_id,
            run.manifest.version.tag_name(),
            run.manifest.release_branch,
            run.overall_status.to_string(),
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<ExitCode> {
    let cfg = config::config()?;

    println!("Release Engine Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Runs:                {}", cfg.runs_dir().display());
    println!("  Ledger:              {}", cfg.ledger_path().display());
    println!();
    println!("Repository:");
    println!("  Work tree:      {}", cfg.repository.path.display());
    println!("  Remote:         {}", cfg.repository.remote);
    println!("  Branch pattern: {}", cfg.repository.branch_pattern);
    println!(
        "  Backport to:    {}",
        cfg.repository.default_branch.as_deref().unwrap_or("(none)")
    );
    println!();
    println!("Execution:");
    println!("  Parallelism:  {}", cfg.execution.parallelism);
    println!("  Max attempts: {}", cfg.execution.retry.max_attempts);
    println!("  Retry delay:  {}ms (x{})", cfg.execution.retry.initial_delay_ms, cfg.execution.retry.backoff_multiplier);
    println!();
    println!("Publish:");
    match cfg.publish.ci_base_url {
        Some(ref url) => {
            println!("  CI:        {}", url);
            println!("  Token:     {}", if cfg.publish.token.is_some() { "set" } else { "(not set)" });
            println!("  Workflows: {}", cfg.publish.workflows.join(", "));
            println!("  Timeout:   {}s", cfg.publish.poll.timeout_ms / 1000);
        }
        None => println!("  (disabled)"),
    }

    Ok(ExitCode::SUCCESS)
}

fn exit_code(run: &ReleaseRun) -> ExitCode {
    ExitCode::from(exit_status(run))
}

fn exit_status(run: &ReleaseRun) -> u8 {
    match run.overall_status {
        RunStatus::Failed if run.is_terminal() => EXIT_FAILURE,
        _ => 0,
    }
}

fn print_run(orchestrator: &Orchestrator, run: &ReleaseRun) {
    let manifest = &run.manifest;

    println!("Run ID: {}", run.run_id);
    println!(
        "Release: {} (patching {} on {})",
        manifest.version.tag_name(),
        manifest.previous_version.tag_name(),
        manifest.release_branch
    );
    println!("Status: {}", run.overall_status);
    println!("Created: {}", run.created_at);
    println!("Updated: {}", run.updated_at);
    if let Some(archived) = run.archived_at {
        println!("Finished: {}", archived);
    }

    println!("\nSteps:");
    for step in orchestrator.graph().steps() {
        let Some(record) = run.record(&step.name) else {
            continue;
        };
        let attempts = if record.attempt_count > 0 {
            format!(" [{} failed attempt(s)]", record.attempt_count)
        } else {
            String::new()
        };
        match record.artifact {
            Some(ref artifact) => println!(
                "  {:<22} {}{} -> {}",
                step.name,
                record.describe_status(),
                attempts,
                artifact
            ),
            None => println!("  {:<22} {}{}", step.name, record.describe_status(), attempts),
        }
    }

    let failures = run.failures();
    if !failures.is_empty() {
        println!("\nFailures:");
        for (step, error) in failures {
            println!("  {}: {}", step, error.unwrap_or("(no error recorded)"));
        }
    }
}
