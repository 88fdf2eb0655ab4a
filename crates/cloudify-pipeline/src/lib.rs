//! Cloudify pipeline definitions, command agents and run reports.

pub mod command;
pub mod report;
pub mod spec;

pub use command::{CommandAgent, ENV_AGENT, ENV_ATTEMPT, ENV_MODEL, ENV_RUN_ID};
pub use report::{
    render_summary_md, write_report_json, write_reports, write_summary_md, AgentOutcome,
    AgentReport, PhaseReport, RunReport, REPORT_JSON, SUMMARY_MD,
};
pub use spec::{AgentSpec, PhaseSpec, PipelineSpec, MIGRATION_TEMPLATE};
