//! Phase scheduler.
//!
//! Phases run in declared order. The agents of one phase are launched
//! together and joined before the next phase starts. A failed agent in a
//! critical phase halts the pipeline; failures in advisory phases are recorded
//! and the run continues.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentResult, AgentRunner};
use crate::bus::EventBus;
use crate::config::{AgentPolicy, OrchestratorConfig};
use crate::context::{CancelHandle, PipelineContext};
use crate::error::PipelineError;
use crate::events::{EventKind, PhaseStatus, PipelineStatus};
use crate::metrics::METRICS;
use crate::obs::{self, PipelineSpan};

const ORCHESTRATOR_SOURCE: &str = "orchestrator";

/// Whether a failed agent halts the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    #[default]
    Critical,
    Advisory,
}

/// A named group of agents executed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub criticality: Criticality,
    pub agents: Vec<String>,
}

impl Phase {
    pub fn new<I, S>(name: impl Into<String>, criticality: Criticality, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            criticality,
            agents: agents.into_iter().map(Into::into).collect(),
        }
    }

    pub fn critical<I, S>(name: impl Into<String>, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, Criticality::Critical, agents)
    }

    pub fn advisory<I, S>(name: impl Into<String>, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, Criticality::Advisory, agents)
    }
}

/// Ordered phases of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub phases: Vec<Phase>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn agent_count(&self) -> usize {
        self.phases.iter().map(|p| p.agents.len()).sum()
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub name: String,
    pub criticality: Criticality,
    pub status: PhaseStatus,
    pub agents: Vec<String>,
    pub failed_agents: Vec<String>,
    pub duration_ms: u64,
}

/// Where a critical failure stopped the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltPoint {
    pub phase: String,
    /// Failed agents of the phase, in declared order.
    pub agents: Vec<String>,
}

/// A tolerated failure in an advisory phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub phase: String,
    pub agent: String,
    pub errors: Vec<String>,
}

/// Final summary of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: PipelineStatus,
    /// Keyed by agent name, independent of completion order.
    pub results: BTreeMap<String, AgentResult>,
    pub phases: Vec<PhaseOutcome>,
    pub halted_at: Option<HaltPoint>,
    pub advisory_failures: Vec<AgentFailure>,
    /// Agents never launched because of a halt or cancellation.
    pub skipped_agents: Vec<String>,
    pub duration_ms: u64,
    /// Distinct models used across all agents.
    pub models_used: BTreeSet<String>,
    pub tool_invocations: usize,
}

impl AggregateResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            PipelineStatus::Succeeded | PipelineStatus::SucceededWithWarnings
        )
    }

    pub fn agents_succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    pub fn agents_failed(&self) -> usize {
        self.results.values().filter(|r| !r.is_success()).count()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Warnings reported by successful agents, keyed by agent.
    pub fn warnings(&self) -> BTreeMap<&str, &[String]> {
        self.results
            .iter()
            .filter(|(_, r)| !r.warnings.is_empty())
            .map(|(name, r)| (name.as_str(), r.warnings.as_slice()))
            .collect()
    }
}

/// Runs pipelines over a set of registered agents.
pub struct Orchestrator {
    bus: EventBus,
    config: OrchestratorConfig,
    routing: Arc<crate::router::RoutingTable>,
    runners: HashMap<String, AgentRunner>,
    cancel: CancelHandle,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut agents: Vec<_> = self.runners.keys().collect();
        agents.sort();
        f.debug_struct("Orchestrator")
            .field("agents", &agents)
            .field("parallel_execution", &self.config.parallel_execution)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(bus: EventBus, config: OrchestratorConfig) -> Self {
        Self {
            bus,
            routing: Arc::new(config.routing.clone()),
            config,
            runners: HashMap::new(),
            cancel: CancelHandle::new(),
        }
    }

    /// An orchestrator with a fresh bus sized from `config`.
    pub fn from_config(config: OrchestratorConfig) -> Self {
        Self::new(EventBus::new(config.history_capacity), config)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn set_parallel_execution(&mut self, parallel: bool) {
        self.config.parallel_execution = parallel;
    }

    /// Register an agent with the configured default policy.
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), PipelineError> {
        let policy = self.config.agent.clone();
        self.register_with_policy(agent, policy)
    }

    pub fn register_with_policy(
        &mut self,
        agent: Arc<dyn Agent>,
        policy: AgentPolicy,
    ) -> Result<(), PipelineError> {
        let name = agent.name().to_string();
        if self.runners.contains_key(&name) {
            return Err(PipelineError::AlreadyRegistered { agent: name });
        }
        self.runners.insert(name, AgentRunner::new(agent, policy));
        Ok(())
    }

    pub fn is_registered(&self, agent: &str) -> bool {
        self.runners.contains_key(agent)
    }

    /// Effective policy of a registered agent.
    pub fn policy_of(&self, agent: &str) -> Option<&AgentPolicy> {
        self.runners.get(agent).map(AgentRunner::policy)
    }

    /// Handle that cancels the current or next run. A cancelled orchestrator
    /// stays cancelled; later runs end immediately as `Cancelled`.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Check the pipeline against the registered agents.
    pub fn validate(&self, pipeline: &Pipeline) -> Result<(), PipelineError> {
        if pipeline.phases.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }
        let mut phase_names = HashSet::new();
        let mut seen_agents: HashMap<&str, &str> = HashMap::new();
        for phase in &pipeline.phases {
            if phase.agents.is_empty() {
                return Err(PipelineError::EmptyPhase {
                    phase: phase.name.clone(),
                });
            }
            if !phase_names.insert(phase.name.as_str()) {
                return Err(PipelineError::DuplicatePhase {
                    phase: phase.name.clone(),
                });
            }
            for agent in &phase.agents {
                if !self.runners.contains_key(agent) {
                    return Err(PipelineError::UnknownAgent {
                        phase: phase.name.clone(),
                        agent: agent.clone(),
                    });
                }
                if let Some(first) = seen_agents.insert(agent, &phase.name) {
                    return Err(PipelineError::DuplicateAgent {
                        agent: agent.clone(),
                        first: first.to_string(),
                        second: phase.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Execute every phase of `pipeline` and return the aggregate.
    ///
    /// Errors only when the pipeline definition is invalid; agent failures are
    /// reported inside the [`AggregateResult`].
    pub async fn run(&mut self, pipeline: &Pipeline) -> Result<AggregateResult, PipelineError> {
        self.validate(pipeline)?;

        let ctx = PipelineContext {
            run_id: Uuid::new_v4(),
            bus: self.bus.clone(),
            routing: Arc::clone(&self.routing),
            cancel: self.cancel.clone(),
        };
        let span = PipelineSpan::new(&ctx.run_id.to_string(), &pipeline.name);
        Ok(span.instrument(self.run_validated(pipeline, ctx)).await)
    }

    async fn run_validated(&mut self, pipeline: &Pipeline, ctx: PipelineContext) -> AggregateResult {
        let run_id = ctx.run_id.to_string();
        let started = Instant::now();
        let total = pipeline.agent_count();
        obs::emit_pipeline_started(&run_id, pipeline.phases.len(), total);

        let progress = Progress::new(self.bus.clone(), total);
        let mut results = BTreeMap::new();
        let mut phases = Vec::with_capacity(pipeline.phases.len());
        let mut halted_at = None;
        let mut advisory_failures = Vec::new();
        let mut skipped_agents = Vec::new();
        let mut cancelled = false;

        for (index, phase) in pipeline.phases.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                self.bus.emit(
                    ORCHESTRATOR_SOURCE,
                    EventKind::PipelineError {
                        phase: None,
                        agents: Vec::new(),
                        reason: self.cancel.reason(),
                    },
                );
                skip_phases(&pipeline.phases[index..], &mut phases, &mut skipped_agents);
                break;
            }

            let phase_started = Instant::now();
            let (phase_results, not_launched) = self.run_phase(phase, &ctx, &progress).await;

            let failed_agents: Vec<String> = phase
                .agents
                .iter()
                .filter(|a| {
                    phase_results
                        .iter()
                        .any(|r| &r.agent == *a && !r.is_success())
                })
                .cloned()
                .collect();
            let status = if failed_agents.is_empty() && not_launched.is_empty() {
                PhaseStatus::Succeeded
            } else {
                PhaseStatus::Failed
            };

            self.bus.emit(
                ORCHESTRATOR_SOURCE,
                EventKind::PhaseComplete {
                    phase: phase.name.clone(),
                    status,
                    failed_agents: failed_agents.clone(),
                },
            );
            obs::emit_phase_finished(&phase.name, status, &failed_agents);

            phases.push(PhaseOutcome {
                name: phase.name.clone(),
                criticality: phase.criticality,
                status,
                agents: phase.agents.clone(),
                failed_agents: failed_agents.clone(),
                duration_ms: phase_started.elapsed().as_millis() as u64,
            });
            skipped_agents.extend(not_launched);

            for result in &phase_results {
                if !result.is_success() && phase.criticality == Criticality::Advisory {
                    advisory_failures.push(AgentFailure {
                        phase: phase.name.clone(),
                        agent: result.agent.clone(),
                        errors: result.errors.clone(),
                    });
                }
            }
            for result in phase_results {
                results.insert(result.agent.clone(), result);
            }

            let remaining = &pipeline.phases[index + 1..];
            if self.cancel.is_cancelled() {
                cancelled = true;
                warn!(phase = %phase.name, "pipeline cancelled");
                self.bus.emit(
                    ORCHESTRATOR_SOURCE,
                    EventKind::PipelineError {
                        phase: Some(phase.name.clone()),
                        agents: failed_agents,
                        reason: self.cancel.reason(),
                    },
                );
                skip_phases(remaining, &mut phases, &mut skipped_agents);
                break;
            }

            if status == PhaseStatus::Failed && phase.criticality == Criticality::Critical {
                let reason = format!(
                    "critical phase '{}' failed: {}",
                    phase.name,
                    failed_agents.join(", ")
                );
                warn!(phase = %phase.name, agents = ?failed_agents, "halting pipeline");
                self.bus.emit(
                    ORCHESTRATOR_SOURCE,
                    EventKind::PipelineError {
                        phase: Some(phase.name.clone()),
                        agents: failed_agents.clone(),
                        reason,
                    },
                );
                halted_at = Some(HaltPoint {
                    phase: phase.name.clone(),
                    agents: failed_agents,
                });
                skip_phases(remaining, &mut phases, &mut skipped_agents);
                break;
            }
        }

        let status = if cancelled {
            PipelineStatus::Cancelled
        } else if halted_at.is_some() {
            PipelineStatus::Failed
        } else if !advisory_failures.is_empty() {
            PipelineStatus::SucceededWithWarnings
        } else {
            PipelineStatus::Succeeded
        };

        let models_used = results
            .values()
            .flat_map(|r| r.models_used.iter().cloned())
            .collect();
        let tool_invocations = results.values().map(|r| r.tools_called.len()).sum();
        let duration_ms = started.elapsed().as_millis() as u64;

        let aggregate = AggregateResult {
            run_id: ctx.run_id,
            pipeline: pipeline.name.clone(),
            status,
            results,
            phases,
            halted_at,
            advisory_failures,
            skipped_agents,
            duration_ms,
            models_used,
            tool_invocations,
        };

        self.bus.emit(
            ORCHESTRATOR_SOURCE,
            EventKind::PipelineComplete {
                status,
                duration_ms,
                agents_succeeded: aggregate.agents_succeeded(),
                agents_failed: aggregate.agents_failed(),
            },
        );
        obs::emit_pipeline_finished(&run_id, status, duration_ms);
        METRICS.flush();

        aggregate
    }

    /// Run one phase; returns the results plus agents never launched.
    async fn run_phase(
        &mut self,
        phase: &Phase,
        ctx: &PipelineContext,
        progress: &Progress,
    ) -> (Vec<AgentResult>, Vec<String>) {
        let parallel = self.config.parallel_execution;
        // Borrowed in place so the registry survives the run future being dropped.
        let mut runners: Vec<&mut AgentRunner> = self
            .runners
            .iter_mut()
            .filter(|(name, _)| phase.agents.contains(name))
            .map(|(_, runner)| runner)
            .collect();
        runners.sort_by_key(|runner| {
            phase
                .agents
                .iter()
                .position(|name| name == runner.name())
        });

        info!(
            phase = %phase.name,
            agents = runners.len(),
            parallel,
            "phase started"
        );

        let mut not_launched = Vec::new();
        let results = if parallel {
            join_all(runners.into_iter().map(|runner| async move {
                let result = runner.execute(ctx).await;
                progress.agent_finished();
                result
            }))
            .await
        } else {
            let mut results = Vec::with_capacity(runners.len());
            for runner in runners {
                if ctx.cancel.is_cancelled() {
                    not_launched.push(runner.name().to_string());
                    continue;
                }
                results.push(runner.execute(ctx).await);
                progress.agent_finished();
            }
            results
        };

        (results, not_launched)
    }
}

fn skip_phases(
    remaining: &[Phase],
    phases: &mut Vec<PhaseOutcome>,
    skipped_agents: &mut Vec<String>,
) {
    for phase in remaining {
        skipped_agents.extend(phase.agents.iter().cloned());
        phases.push(PhaseOutcome {
            name: phase.name.clone(),
            criticality: phase.criticality,
            status: PhaseStatus::Skipped,
            agents: phase.agents.clone(),
            failed_agents: Vec::new(),
            duration_ms: 0,
        });
    }
}

/// Publishes `ProgressUpdate` each time an agent reaches a terminal state.
struct Progress {
    bus: EventBus,
    total: usize,
    completed: AtomicUsize,
}

impl Progress {
    fn new(bus: EventBus, total: usize) -> Self {
        Self {
            bus,
            total,
            completed: AtomicUsize::new(0),
        }
    }

    fn agent_finished(&self) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        let percentage = if self.total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / self.total as f64
        };
        self.bus.emit(
            ORCHESTRATOR_SOURCE,
            EventKind::ProgressUpdate {
                completed,
                total: self.total,
                percentage,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOutput;
    use crate::context::AgentContext;
    use crate::error::AgentError;
    use async_trait::async_trait;

    struct Stub {
        name: String,
        fail: bool,
    }

    #[async_trait]
    impl Agent for Stub {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
            if self.fail {
                Err(AgentError::work("boom"))
            } else {
                Ok(AgentOutput::new())
            }
        }
    }

    fn stub(name: &str, fail: bool) -> Arc<dyn Agent> {
        Arc::new(Stub {
            name: name.to_string(),
            fail,
        })
    }

    fn orchestrator(agents: &[(&str, bool)]) -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.agent = AgentPolicy::once();
        let mut o = Orchestrator::from_config(config);
        for (name, fail) in agents {
            o.register(stub(name, *fail)).unwrap();
        }
        o
    }

    #[test]
    fn validation_rejects_malformed_pipelines() {
        let o = orchestrator(&[("a", false), ("b", false)]);

        assert_eq!(
            o.validate(&Pipeline::new("p")),
            Err(PipelineError::EmptyPipeline)
        );
        assert!(matches!(
            o.validate(&Pipeline::new("p").phase(Phase::critical("x", Vec::<String>::new()))),
            Err(PipelineError::EmptyPhase { .. })
        ));
        assert!(matches!(
            o.validate(
                &Pipeline::new("p")
                    .phase(Phase::critical("x", ["a"]))
                    .phase(Phase::critical("x", ["b"]))
            ),
            Err(PipelineError::DuplicatePhase { .. })
        ));
        assert!(matches!(
            o.validate(&Pipeline::new("p").phase(Phase::critical("x", ["ghost"]))),
            Err(PipelineError::UnknownAgent { .. })
        ));
        assert!(matches!(
            o.validate(
                &Pipeline::new("p")
                    .phase(Phase::critical("x", ["a"]))
                    .phase(Phase::advisory("y", ["a"]))
            ),
            Err(PipelineError::DuplicateAgent { .. })
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut o = orchestrator(&[("a", false)]);
        assert_eq!(
            o.register(stub("a", true)),
            Err(PipelineError::AlreadyRegistered {
                agent: "a".to_string()
            })
        );
    }

    #[tokio::test]
    async fn invalid_pipeline_publishes_nothing() {
        let mut o = orchestrator(&[("a", false)]);
        let err = o
            .run(&Pipeline::new("p").phase(Phase::critical("x", ["ghost"])))
            .await;
        assert!(err.is_err());
        assert_eq!(o.bus().history_len(), 0);
    }

    #[tokio::test]
    async fn runners_are_reusable_across_runs() {
        let mut o = orchestrator(&[("a", false)]);
        let pipeline = Pipeline::new("p").phase(Phase::critical("x", ["a"]));
        assert!(o.run(&pipeline).await.unwrap().is_success());
        assert!(o.run(&pipeline).await.unwrap().is_success());
        assert!(o.is_registered("a"));
    }

    #[tokio::test]
    async fn progress_reaches_one_hundred_percent() {
        let mut o = orchestrator(&[("a", false), ("b", false)]);
        let pipeline = Pipeline::new("p").phase(Phase::critical("x", ["a", "b"]));
        o.run(&pipeline).await.unwrap();

        let updates = o
            .bus()
            .history_of(crate::events::EventType::ProgressUpdate);
        assert_eq!(updates.len(), 2);
        match &updates[1].kind {
            EventKind::ProgressUpdate {
                completed,
                total,
                percentage,
            } => {
                assert_eq!((*completed, *total), (2, 2));
                assert!((percentage - 100.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_everything() {
        let mut o = orchestrator(&[("a", false)]);
        o.cancel("shutdown");
        let result = o
            .run(&Pipeline::new("p").phase(Phase::critical("x", ["a"])))
            .await
            .unwrap();
        assert_eq!(result.status, PipelineStatus::Cancelled);
        assert_eq!(result.skipped_agents, vec!["a".to_string()]);
        assert!(result.results.is_empty());
        assert!(!result.is_success());
    }
}
