//! Cloudify CLI
//!
//! The `cloudify` command runs declarative agent pipelines.
//!
//! ## Commands
//!
//! - `run`: Execute a pipeline definition and optionally write reports
//!   (`--dry-run` prints the phase plan instead)
//! - `validate`: Check a pipeline definition without running it
//! - `init`: Write the built-in migration pipeline template
//! - `models`: Show the model routing table

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloudify_core::{
    AggregateResult, Criticality, EventKind, EventType, HandlerError, Orchestrator,
    OrchestratorConfig, Pipeline, PipelineStatus,
};
use cloudify_pipeline::{write_reports, PipelineSpec, RunReport, MIGRATION_TEMPLATE};
use serde::Serialize;
use tracing::{info, warn, Level};

/// Exit code used when a run is cancelled by an interrupt (128 + SIGINT).
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "cloudify")]
#[command(author = "Cloudify Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Agent pipeline orchestration for cloud migrations", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline definition
    Run {
        /// Pipeline definition (TOML, or JSON with a .json extension)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Orchestrator configuration file (TOML)
        #[arg(short, long, env = "CLOUDIFY_CONFIG")]
        config: Option<PathBuf>,

        /// Directory for pipeline_report.json and pipeline_summary.md
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Run the agents of each phase one at a time
        #[arg(long)]
        sequential: bool,

        /// Validate and print the phase plan without launching agents
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a pipeline definition without running it
    Validate {
        #[arg(short, long)]
        pipeline: PathBuf,

        #[arg(short, long, env = "CLOUDIFY_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Write the built-in migration pipeline template
    Init {
        /// Destination file
        #[arg(default_value = "pipeline.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the model routing table
    Models {
        #[arg(short, long, env = "CLOUDIFY_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        cloudify_core::LogFormat::Json
    } else {
        cloudify_core::LogFormat::Text
    };
    cloudify_core::init_tracing(format, level);

    match cli.command {
        Commands::Run {
            pipeline,
            config,
            report_dir,
            sequential,
            dry_run,
        } => {
            if dry_run {
                cmd_plan(&pipeline, config.as_deref(), sequential, cli.json)?;
                return Ok(ExitCode::SUCCESS);
            }
            let status = cmd_run(
                &pipeline,
                config.as_deref(),
                report_dir.as_deref(),
                sequential,
                cli.json,
            )
            .await?;
            Ok(ExitCode::from(exit_status(status)))
        }
        Commands::Validate { pipeline, config } => {
            cmd_validate(&pipeline, config.as_deref(), cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init { path, force } => {
            cmd_init(&path, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Models { config } => {
            cmd_models(config.as_deref(), cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path)),
        None => {
            let mut config = OrchestratorConfig::default();
            config
                .apply_env_overrides()
                .context("Invalid CLOUDIFY_* environment override")?;
            Ok(config)
        }
    }
}

/// Process exit status for a finished run.
fn exit_status(status: PipelineStatus) -> u8 {
    match status {
        PipelineStatus::Succeeded | PipelineStatus::SucceededWithWarnings => 0,
        PipelineStatus::Failed => 1,
        PipelineStatus::Cancelled => EXIT_CANCELLED,
    }
}

/// One human-readable progress line per event, or `None` for events not shown.
fn describe(kind: &EventKind) -> Option<String> {
    let line = match kind {
        EventKind::AgentStarted { agent, .. } => format!("-> {agent} started"),
        EventKind::AgentCompleted {
            agent, duration_ms, ..
        } => format!("ok {agent} completed in {duration_ms}ms"),
        EventKind::AgentFailed { agent, errors, .. } => format!(
            "!! {agent} failed: {}",
            errors.last().map(String::as_str).unwrap_or("unknown error")
        ),
        EventKind::PhaseComplete { phase, status, .. } => {
            format!("== phase {phase}: {}", serde_plain(status))
        }
        EventKind::ProgressUpdate {
            completed,
            total,
            percentage,
        } => format!("   progress {completed}/{total} ({percentage:.0}%)"),
        EventKind::ModelHandoff {
            agent,
            from_model,
            to_model,
            ..
        } => format!("   {agent}: model {from_model} -> {to_model}"),
        EventKind::PipelineError { reason, .. } => format!("!! {reason}"),
        EventKind::ToolInvoked { .. } | EventKind::PipelineComplete { .. } => return None,
    };
    Some(line)
}

fn serde_plain<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn subscribe_console(orchestrator: &Orchestrator) {
    for event_type in [
        EventType::AgentStarted,
        EventType::AgentCompleted,
        EventType::AgentFailed,
        EventType::PhaseComplete,
        EventType::ProgressUpdate,
        EventType::ModelHandoff,
        EventType::PipelineError,
    ] {
        orchestrator.bus().subscribe(event_type, |event| {
            if let Some(line) = describe(&event.kind) {
                eprintln!("{line}");
            }
            Ok::<(), HandlerError>(())
        });
    }
}

/// A pipeline installed on an orchestrator, ready to run.
struct Prepared {
    spec: PipelineSpec,
    digest: String,
    orchestrator: Orchestrator,
    pipeline: Pipeline,
}

fn prepare(pipeline_path: &Path, config_path: Option<&Path>, sequential: bool) -> Result<Prepared> {
    let config = load_config(config_path)?;
    let spec = PipelineSpec::load(pipeline_path)?;
    let digest = spec.digest()?;

    let mut orchestrator = Orchestrator::from_config(config);
    if sequential {
        orchestrator.set_parallel_execution(false);
    }
    let pipeline = spec.install(&mut orchestrator)?;
    Ok(Prepared {
        spec,
        digest,
        orchestrator,
        pipeline,
    })
}

/// What `run` would launch, with each agent's effective policy.
#[derive(Debug, Serialize)]
struct RunPlan {
    dry_run: bool,
    pipeline: String,
    digest: String,
    parallel_execution: bool,
    phases: Vec<PlannedPhase>,
}

#[derive(Debug, Serialize)]
struct PlannedPhase {
    name: String,
    criticality: Criticality,
    agents: Vec<PlannedAgent>,
}

#[derive(Debug, Serialize)]
struct PlannedAgent {
    name: String,
    attempt_limit: u32,
    timeout_secs: Option<u64>,
    rollback_on_failure: bool,
}

impl RunPlan {
    fn new(prepared: &Prepared) -> Self {
        let orchestrator = &prepared.orchestrator;
        let phases = prepared
            .pipeline
            .phases
            .iter()
            .map(|phase| PlannedPhase {
                name: phase.name.clone(),
                criticality: phase.criticality,
                agents: phase
                    .agents
                    .iter()
                    .map(|agent| {
                        let policy = orchestrator
                            .policy_of(agent)
                            .unwrap_or(&orchestrator.config().agent);
                        PlannedAgent {
                            name: agent.clone(),
                            attempt_limit: policy.attempt_limit(),
                            timeout_secs: policy.timeout_secs,
                            rollback_on_failure: policy.rollback_on_failure,
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            dry_run: true,
            pipeline: prepared.spec.name.clone(),
            digest: prepared.digest.clone(),
            parallel_execution: orchestrator.config().parallel_execution,
            phases,
        }
    }
}

/// Print the phase plan of a pipeline without launching agents
fn cmd_plan(
    pipeline_path: &Path,
    config_path: Option<&Path>,
    sequential: bool,
    json: bool,
) -> Result<()> {
    let prepared = prepare(pipeline_path, config_path, sequential)?;
    let plan = RunPlan::new(&prepared);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    println!("Dry run of pipeline '{}'", plan.pipeline);
    println!("Digest: {}", plan.digest);
    println!(
        "Mode:   {}",
        if plan.parallel_execution {
            "parallel"
        } else {
            "sequential"
        }
    );
    for (i, phase) in plan.phases.iter().enumerate() {
        println!("  {}. {} [{}]", i + 1, phase.name, serde_plain(&phase.criticality));
        for agent in &phase.agents {
            let timeout = agent
                .timeout_secs
                .map_or_else(|| "none".to_string(), |secs| format!("{secs}s"));
            println!(
                "     - {}: {} attempt(s), timeout {}, rollback {}",
                agent.name,
                agent.attempt_limit,
                timeout,
                if agent.rollback_on_failure { "on" } else { "off" }
            );
        }
    }
    Ok(())
}

/// Run a pipeline definition
async fn cmd_run(
    pipeline_path: &Path,
    config_path: Option<&Path>,
    report_dir: Option<&Path>,
    sequential: bool,
    json: bool,
) -> Result<PipelineStatus> {
    let Prepared {
        spec,
        digest,
        mut orchestrator,
        pipeline,
    } = prepare(pipeline_path, config_path, sequential)?;
    if !json {
        subscribe_console(&orchestrator);
    }

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling pipeline");
            cancel.cancel("interrupted by user");
        }
    });

    info!(pipeline = %spec.name, digest = %digest, "starting pipeline");
    let result = orchestrator.run(&pipeline).await?;

    let report = RunReport::from_aggregate(&result, Some(digest));
    if let Some(dir) = report_dir {
        let (json_path, md_path) = write_reports(dir, &report)?;
        info!(report = ?json_path, summary = ?md_path, "reports written");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&result);
    }

    Ok(result.status)
}

fn print_summary(result: &AggregateResult) {
    println!();
    println!("Pipeline {}: {}", result.pipeline, result.status);
    println!("Run:      {}", result.run_id);
    println!(
        "Agents:   {} succeeded, {} failed, {} skipped",
        result.agents_succeeded(),
        result.agents_failed(),
        result.skipped_agents.len()
    );
    println!("Duration: {:.1}s", result.duration_ms as f64 / 1000.0);
    println!("Tools:    {} invocation(s)", result.tool_invocations);
    if !result.models_used.is_empty() {
        let models: Vec<_> = result.models_used.iter().map(String::as_str).collect();
        println!("Models:   {}", models.join(", "));
    }
    if let Some(halt) = &result.halted_at {
        println!(
            "\nHalted in phase '{}' by: {}",
            halt.phase,
            halt.agents.join(", ")
        );
    }
    if !result.advisory_failures.is_empty() {
        println!("\nAdvisory failures:");
        for failure in &result.advisory_failures {
            println!("  - {} ({})", failure.agent, failure.phase);
        }
    }
    for (agent, warnings) in result.warnings() {
        for warning in warnings {
            println!("  warning [{agent}]: {warning}");
        }
    }
}

/// Validate a pipeline definition against a throwaway orchestrator
fn cmd_validate(pipeline_path: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let spec = PipelineSpec::load(pipeline_path)?;
    let mut orchestrator = Orchestrator::from_config(config);
    let pipeline = spec.install(&mut orchestrator)?;
    let digest = spec.digest()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "valid": true,
                "pipeline": spec.name,
                "digest": digest,
                "phases": pipeline.phases,
            }))?
        );
    } else {
        println!("Pipeline '{}' is valid", spec.name);
        println!("Digest: {}", digest);
        for phase in &pipeline.phases {
            println!(
                "  {} [{}]: {}",
                phase.name,
                serde_plain(&phase.criticality),
                phase.agents.join(", ")
            );
        }
    }
    Ok(())
}

/// Write the migration template
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    std::fs::write(path, MIGRATION_TEMPLATE).with_context(|| format!("write {:?}", path))?;
    println!("Wrote migration pipeline to {:?}", path);
    println!("Edit the agent commands, then run: cloudify run --pipeline {}", path.display());
    Ok(())
}

/// Print the model routing table
fn cmd_models(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config.routing)?);
        return Ok(());
    }
    for (role, route) in config.routing.iter() {
        println!("{role}");
        println!("  primary:   {}", route.primary);
        for (i, fallback) in route.fallbacks.iter().enumerate() {
            println!("  fallback {}: {}", i + 1, fallback);
        }
    }
    Ok(())
}
