//! Pipeline event taxonomy.
//!
//! Every event carries a strongly-typed payload in [`EventKind`]; handlers
//! subscribe by the payload-free [`EventType`] discriminant.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentStatus, ToolInvocationRecord};
use crate::router::ModelRole;

/// Terminal state of a phase once all its agents have finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    /// At least one agent failed.
    Failed,
    /// Never launched because the pipeline halted or was cancelled first.
    Skipped,
}

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    /// Every critical phase succeeded but an advisory phase recorded failures.
    SucceededWithWarnings,
    Failed,
    Cancelled,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::SucceededWithWarnings => "succeeded_with_warnings",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Event payloads, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    AgentStarted {
        agent: String,
        /// Maximum number of work attempts this execution may make.
        attempt_limit: u32,
    },

    AgentCompleted {
        agent: String,
        status: AgentStatus,
        models_used: BTreeSet<String>,
        tools_called: Vec<ToolInvocationRecord>,
        duration_ms: u64,
    },

    AgentFailed {
        agent: String,
        errors: Vec<String>,
        duration_ms: u64,
    },

    ToolInvoked {
        agent: String,
        tool_name: String,
        duration_ms: u64,
        succeeded: bool,
    },

    PhaseComplete {
        phase: String,
        status: PhaseStatus,
        failed_agents: Vec<String>,
    },

    PipelineComplete {
        status: PipelineStatus,
        duration_ms: u64,
        agents_succeeded: usize,
        agents_failed: usize,
    },

    PipelineError {
        phase: Option<String>,
        agents: Vec<String>,
        reason: String,
    },

    ProgressUpdate {
        completed: usize,
        total: usize,
        percentage: f64,
    },

    ModelHandoff {
        agent: String,
        role: ModelRole,
        from_model: String,
        to_model: String,
        reason: String,
    },
}

/// Payload-free discriminant of [`EventKind`], used as a subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStarted,
    AgentCompleted,
    AgentFailed,
    ToolInvoked,
    PhaseComplete,
    PipelineComplete,
    PipelineError,
    ProgressUpdate,
    ModelHandoff,
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::AgentStarted { .. } => EventType::AgentStarted,
            EventKind::AgentCompleted { .. } => EventType::AgentCompleted,
            EventKind::AgentFailed { .. } => EventType::AgentFailed,
            EventKind::ToolInvoked { .. } => EventType::ToolInvoked,
            EventKind::PhaseComplete { .. } => EventType::PhaseComplete,
            EventKind::PipelineComplete { .. } => EventType::PipelineComplete,
            EventKind::PipelineError { .. } => EventType::PipelineError,
            EventKind::ProgressUpdate { .. } => EventType::ProgressUpdate,
            EventKind::ModelHandoff { .. } => EventType::ModelHandoff,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::AgentStarted => "agent_started",
            EventType::AgentCompleted => "agent_completed",
            EventType::AgentFailed => "agent_failed",
            EventType::ToolInvoked => "tool_invoked",
            EventType::PhaseComplete => "phase_complete",
            EventType::PipelineComplete => "pipeline_complete",
            EventType::PipelineError => "pipeline_error",
            EventType::ProgressUpdate => "progress_update",
            EventType::ModelHandoff => "model_handoff",
        };
        write!(f, "{s}")
    }
}

/// A published event. Immutable once the bus has assigned its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identity; two publishes of equal payloads get distinct ids.
    pub id: Uuid,

    /// Bus-assigned position in publish order (starts at 1).
    pub seq: u64,

    /// Name of the agent or component that published the event.
    pub source: String,

    pub timestamp: DateTime<Utc>,

    pub kind: EventKind,
}

impl Event {
    /// Create an unsequenced event; the bus assigns `seq` on publish.
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            source: source.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Agent name carried by agent-scoped payloads.
    pub fn agent(&self) -> Option<&str> {
        match &self.kind {
            EventKind::AgentStarted { agent, .. }
            | EventKind::AgentCompleted { agent, .. }
            | EventKind::AgentFailed { agent, .. }
            | EventKind::ToolInvoked { agent, .. }
            | EventKind::ModelHandoff { agent, .. } => Some(agent.as_str()),
            _ => None,
        }
    }
}
