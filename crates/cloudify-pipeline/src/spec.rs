//! Declarative pipeline definitions.
//!
//! A [`PipelineSpec`] is read from TOML or JSON, checked, and turned into a
//! core [`Pipeline`] plus one [`CommandAgent`] per enabled agent entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cloudify_core::{AgentPolicy, Criticality, ModelRole, Orchestrator, Phase, Pipeline};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::command::CommandAgent;

/// Built-in migration pipeline, written by `cloudify init`.
pub const MIGRATION_TEMPLATE: &str = include_str!("../templates/migration.toml");

/// Pipeline definition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub phases: Vec<PhaseSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,

    #[serde(default)]
    pub criticality: Criticality,

    pub agents: Vec<AgentSpec>,
}

/// One command-backed agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,

    /// Command to execute (first element is the executable).
    pub command: Vec<String>,

    /// Command run once if the agent ends failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Vec<String>>,

    /// Role whose routed model is exported as `CLOUDIFY_MODEL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_role: Option<ModelRole>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// `0` disables the timeout for this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            rollback: None,
            model_role: None,
            env: BTreeMap::new(),
            working_dir: None,
            max_retries: None,
            timeout_secs: None,
            enabled: true,
        }
    }

    /// Per-agent overrides applied on top of `defaults`.
    pub fn policy(&self, defaults: &AgentPolicy) -> AgentPolicy {
        let mut policy = defaults.clone();
        if let Some(max_retries) = self.max_retries {
            policy.max_retries = max_retries;
        }
        if let Some(secs) = self.timeout_secs {
            policy.timeout_secs = (secs > 0).then_some(secs);
        }
        policy
    }

    pub fn to_agent(&self) -> CommandAgent {
        let mut agent = CommandAgent::new(&self.name, self.command.clone()).with_envs(self.env.clone());
        if let Some(rollback) = &self.rollback {
            agent = agent.with_rollback(rollback.clone());
        }
        if let Some(role) = self.model_role {
            agent = agent.with_model_role(role);
        }
        if let Some(dir) = &self.working_dir {
            agent = agent.with_working_dir(dir);
        }
        agent
    }
}

impl PipelineSpec {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let spec: Self = toml::from_str(raw).context("parse pipeline TOML")?;
        spec.check()?;
        Ok(spec)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(raw).context("parse pipeline JSON")?;
        spec.check()?;
        Ok(spec)
    }

    /// Load a definition; `.json` files are JSON, everything else TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let spec = if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        };
        spec.with_context(|| format!("load pipeline {:?}", path))
    }

    /// The built-in analysis, infrastructure, database and deployment pipeline.
    pub fn migration_template() -> Result<Self> {
        Self::from_toml_str(MIGRATION_TEMPLATE)
    }

    /// Checks that do not need an orchestrator.
    fn check(&self) -> Result<()> {
        for phase in &self.phases {
            for agent in &phase.agents {
                if agent.command.is_empty() {
                    anyhow::bail!(
                        "agent '{}' in phase '{}' has an empty command",
                        agent.name,
                        phase.name
                    );
                }
                if matches!(&agent.rollback, Some(cmd) if cmd.is_empty()) {
                    anyhow::bail!("agent '{}' has an empty rollback command", agent.name);
                }
            }
        }
        Ok(())
    }

    /// Deterministic SHA-256 over the canonical JSON form of the definition.
    pub fn digest(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self).context("serialize pipeline for digest")?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Core pipeline over the enabled agents. Phases left empty are dropped.
    pub fn to_pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::new(&self.name);
        for phase in &self.phases {
            let agents: Vec<&str> = phase
                .agents
                .iter()
                .filter(|a| a.enabled)
                .map(|a| a.name.as_str())
                .collect();
            if agents.is_empty() {
                debug!(phase = %phase.name, "dropping phase with no enabled agents");
                continue;
            }
            pipeline = pipeline.phase(Phase::new(&phase.name, phase.criticality, agents));
        }
        pipeline
    }

    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentSpec> {
        self.phases
            .iter()
            .flat_map(|p| p.agents.iter())
            .filter(|a| a.enabled)
    }

    /// Register every enabled agent and return the pipeline to run.
    ///
    /// The orchestrator's configured agent policy is the default; per-agent
    /// `max_retries` and `timeout_secs` override it.
    pub fn install(&self, orchestrator: &mut Orchestrator) -> Result<Pipeline> {
        let defaults = orchestrator.config().agent.clone();
        for spec in self.enabled_agents() {
            orchestrator
                .register_with_policy(Arc::new(spec.to_agent()), spec.policy(&defaults))
                .with_context(|| format!("register agent '{}'", spec.name))?;
        }
        let pipeline = self.to_pipeline();
        orchestrator
            .validate(&pipeline)
            .with_context(|| format!("validate pipeline '{}'", self.name))?;
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudify_core::OrchestratorConfig;

    const SAMPLE: &str = r#"
        name = "sample"

        [[phases]]
        name = "analysis"
        criticality = "critical"

        [[phases.agents]]
        name = "scan"
        command = ["echo", "scan"]
        model_role = "planning"
        max_retries = 0

        [[phases]]
        name = "database"
        criticality = "advisory"

        [[phases.agents]]
        name = "migrate"
        command = ["echo", "migrate"]
        timeout_secs = 0
        env = { DB_URL = "postgres://localhost/app" }
    "#;

    #[test]
    fn parses_toml_definition() {
        let spec = PipelineSpec::from_toml_str(SAMPLE).unwrap();
        assert_eq!(spec.name, "sample");
        assert_eq!(spec.phases.len(), 2);
        assert_eq!(spec.phases[1].criticality, Criticality::Advisory);
        let scan = &spec.phases[0].agents[0];
        assert_eq!(scan.model_role, Some(ModelRole::Planning));
        assert!(scan.enabled);
    }

    #[test]
    fn json_and_toml_forms_share_a_digest() {
        let spec = PipelineSpec::from_toml_str(SAMPLE).unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        let again = PipelineSpec::from_json_str(&json).unwrap();
        assert_eq!(spec.digest().unwrap(), again.digest().unwrap());
        assert_eq!(spec.digest().unwrap().len(), 64);
    }

    #[test]
    fn digest_changes_with_definition() {
        let a = PipelineSpec::from_toml_str(SAMPLE).unwrap();
        let mut b = a.clone();
        b.phases[0].agents[0].command.push("--deep".to_string());
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn per_agent_policy_overrides_defaults() {
        let spec = PipelineSpec::from_toml_str(SAMPLE).unwrap();
        let defaults = AgentPolicy::default();
        let scan = spec.phases[0].agents[0].policy(&defaults);
        assert_eq!(scan.max_retries, 0);
        assert_eq!(scan.timeout_secs, Some(300));
        let migrate = spec.phases[1].agents[0].policy(&defaults);
        assert_eq!(migrate.max_retries, 2);
        assert_eq!(migrate.timeout_secs, None);
    }

    #[test]
    fn empty_command_is_rejected() {
        let raw = r#"
            name = "bad"
            [[phases]]
            name = "p"
            [[phases.agents]]
            name = "a"
            command = []
        "#;
        let err = PipelineSpec::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn disabled_agents_are_left_out() {
        let mut spec = PipelineSpec::from_toml_str(SAMPLE).unwrap();
        spec.phases[1].agents[0].enabled = false;
        let pipeline = spec.to_pipeline();
        assert_eq!(pipeline.phases.len(), 1);
        assert_eq!(spec.enabled_agents().count(), 1);
    }

    #[test]
    fn install_registers_and_validates() {
        let spec = PipelineSpec::from_toml_str(SAMPLE).unwrap();
        let mut orchestrator = Orchestrator::from_config(OrchestratorConfig::default());
        let pipeline = spec.install(&mut orchestrator).unwrap();
        assert_eq!(pipeline.agent_count(), 2);
        assert!(orchestrator.is_registered("scan"));
        assert!(orchestrator.is_registered("migrate"));
    }

    #[test]
    fn duplicate_agent_names_fail_install() {
        let raw = r#"
            name = "dup"
            [[phases]]
            name = "one"
            [[phases.agents]]
            name = "a"
            command = ["true"]
            [[phases]]
            name = "two"
            [[phases.agents]]
            name = "a"
            command = ["true"]
        "#;
        let spec = PipelineSpec::from_toml_str(raw).unwrap();
        let mut orchestrator = Orchestrator::from_config(OrchestratorConfig::default());
        assert!(spec.install(&mut orchestrator).is_err());
    }

    #[test]
    fn migration_template_is_valid() {
        let spec = PipelineSpec::migration_template().unwrap();
        let names: Vec<_> = spec.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["analysis", "infrastructure", "database", "deployment"]
        );
        assert_eq!(spec.phases[2].criticality, Criticality::Advisory);
        assert_eq!(spec.phases[3].agents.len(), 2);

        let mut orchestrator = Orchestrator::from_config(OrchestratorConfig::default());
        assert!(spec.install(&mut orchestrator).is_ok());
    }
}
