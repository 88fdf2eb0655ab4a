//! Run reports: `pipeline_report.json` and a Markdown summary.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cloudify_core::{
    AgentFailure, AggregateResult, AgentStatus, Criticality, HaltPoint, PhaseStatus,
    PipelineStatus,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SCHEMA_VERSION: &str = "1.0";
pub const REPORT_JSON: &str = "pipeline_report.json";
pub const SUMMARY_MD: &str = "pipeline_summary.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub name: String,
    pub outcome: AgentOutcome,
    pub attempts: u32,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub models_used: BTreeSet<String>,
    pub tool_invocations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub criticality: Criticality,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    pub agents: Vec<AgentReport>,
}

/// Persisted summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_digest: Option<String>,
    pub status: PipelineStatus,
    pub duration_ms: u64,
    pub agents_succeeded: usize,
    pub agents_failed: usize,
    pub agents_skipped: usize,
    pub models_used: BTreeSet<String>,
    pub tool_invocations: usize,
    pub halted_at: Option<HaltPoint>,
    pub advisory_failures: Vec<AgentFailure>,
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    pub fn from_aggregate(result: &AggregateResult, pipeline_digest: Option<String>) -> Self {
        let phases = result
            .phases
            .iter()
            .map(|phase| PhaseReport {
                name: phase.name.clone(),
                criticality: phase.criticality,
                status: phase.status,
                duration_ms: phase.duration_ms,
                agents: phase
                    .agents
                    .iter()
                    .map(|name| match result.results.get(name) {
                        Some(r) => AgentReport {
                            name: name.clone(),
                            outcome: match r.status {
                                AgentStatus::Success => AgentOutcome::Success,
                                AgentStatus::Failed => AgentOutcome::Failed,
                            },
                            attempts: r.attempts,
                            duration_ms: r.duration.as_millis() as u64,
                            errors: r.errors.clone(),
                            warnings: r.warnings.clone(),
                            models_used: r.models_used.clone(),
                            tool_invocations: r.tools_called.len(),
                        },
                        None => AgentReport {
                            name: name.clone(),
                            outcome: AgentOutcome::Skipped,
                            attempts: 0,
                            duration_ms: 0,
                            errors: Vec::new(),
                            warnings: Vec::new(),
                            models_used: BTreeSet::new(),
                            tool_invocations: 0,
                        },
                    })
                    .collect(),
            })
            .collect();

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            run_id: result.run_id,
            pipeline: result.pipeline.clone(),
            pipeline_digest,
            status: result.status,
            duration_ms: result.duration_ms,
            agents_succeeded: result.agents_succeeded(),
            agents_failed: result.agents_failed(),
            agents_skipped: result.skipped_agents.len(),
            models_used: result.models_used.clone(),
            tool_invocations: result.tool_invocations,
            halted_at: result.halted_at.clone(),
            advisory_failures: result.advisory_failures.clone(),
            phases,
        }
    }
}

/// Write the report as pretty JSON.
pub fn write_report_json(path: &Path, report: &RunReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

fn status_label(status: PipelineStatus) -> &'static str {
    match status {
        PipelineStatus::Succeeded => "succeeded",
        PipelineStatus::SucceededWithWarnings => "succeeded with warnings",
        PipelineStatus::Failed => "failed",
        PipelineStatus::Cancelled => "cancelled",
    }
}

fn phase_label(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Succeeded => "succeeded",
        PhaseStatus::Failed => "failed",
        PhaseStatus::Skipped => "skipped",
    }
}

fn outcome_label(outcome: AgentOutcome) -> &'static str {
    match outcome {
        AgentOutcome::Success => "success",
        AgentOutcome::Failed => "failed",
        AgentOutcome::Skipped => "skipped",
    }
}

/// Render the Markdown summary.
pub fn render_summary_md(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Pipeline `{}`\n\n", report.pipeline));
    out.push_str(&format!("- status: {}\n", status_label(report.status)));
    out.push_str(&format!("- run: `{}`\n", report.run_id));
    if let Some(digest) = &report.pipeline_digest {
        out.push_str(&format!("- definition digest: `{}`\n", digest));
    }
    out.push_str(&format!(
        "- duration: {:.1}s\n- agents: {} succeeded, {} failed, {} skipped\n- tool invocations: {}\n",
        report.duration_ms as f64 / 1000.0,
        report.agents_succeeded,
        report.agents_failed,
        report.agents_skipped,
        report.tool_invocations
    ));
    if !report.models_used.is_empty() {
        let models: Vec<_> = report.models_used.iter().map(|m| format!("`{m}`")).collect();
        out.push_str(&format!("- models: {}\n", models.join(", ")));
    }
    out.push('\n');

    if let Some(halt) = &report.halted_at {
        out.push_str(&format!(
            "**Halted** in phase `{}` by: {}\n\n",
            halt.phase,
            halt.agents.join(", ")
        ));
    }

    out.push_str("## Phases\n\n");
    out.push_str("| phase | criticality | status | agent | outcome | attempts | duration |\n");
    out.push_str("|---|---|---|---|---|---|---|\n");
    for phase in &report.phases {
        let criticality = match phase.criticality {
            Criticality::Critical => "critical",
            Criticality::Advisory => "advisory",
        };
        for agent in &phase.agents {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {}ms |\n",
                phase.name,
                criticality,
                phase_label(phase.status),
                agent.name,
                outcome_label(agent.outcome),
                agent.attempts,
                agent.duration_ms
            ));
        }
    }
    out.push('\n');

    if !report.advisory_failures.is_empty() {
        out.push_str("## Advisory failures\n");
        for failure in &report.advisory_failures {
            out.push_str(&format!("- `{}` ({})\n", failure.agent, failure.phase));
            for error in &failure.errors {
                out.push_str(&format!("  - {}\n", error));
            }
        }
        out.push('\n');
    }

    let warnings: Vec<_> = report
        .phases
        .iter()
        .flat_map(|p| p.agents.iter())
        .filter(|a| !a.warnings.is_empty())
        .collect();
    if !warnings.is_empty() {
        out.push_str("## Warnings\n");
        for agent in warnings {
            for warning in &agent.warnings {
                out.push_str(&format!("- `{}`: {}\n", agent.name, warning));
            }
        }
        out.push('\n');
    }

    let failed: Vec<_> = report
        .phases
        .iter()
        .filter(|p| p.criticality == Criticality::Critical)
        .flat_map(|p| p.agents.iter())
        .filter(|a| a.outcome == AgentOutcome::Failed)
        .collect();
    if !failed.is_empty() {
        out.push_str("## Errors\n");
        for agent in failed {
            for error in &agent.errors {
                out.push_str(&format!("- `{}`: {}\n", agent.name, error));
            }
        }
    }
    out
}

pub fn write_summary_md(path: &Path, report: &RunReport) -> Result<()> {
    let md = render_summary_md(report);
    std::fs::write(path, md).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Write both artifacts into `dir`, creating it if needed.
pub fn write_reports(dir: &Path, report: &RunReport) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    let json = dir.join(REPORT_JSON);
    let md = dir.join(SUMMARY_MD);
    write_report_json(&json, report)?;
    write_summary_md(&md, report)?;
    Ok((json, md))
}
