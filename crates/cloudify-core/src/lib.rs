//! Cloudify Core Library
//!
//! Event bus, agent lifecycle, tool invocation tracking, model routing and
//! the phase scheduler that drives Cloudify pipelines.

pub mod agent;
pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod router;
pub mod telemetry;
pub mod tracker;

pub use agent::{
    Agent, AgentOutput, AgentResult, AgentRunner, AgentState, AgentStatus, ToolInvocationRecord,
};
pub use bus::{EventBus, EventHandler, SubscriptionId, DEFAULT_HISTORY_CAPACITY};
pub use config::{AgentPolicy, OrchestratorConfig};
pub use context::{AgentContext, CancelHandle, PipelineContext};
pub use error::{AgentError, ConfigError, HandlerError, PipelineError, Result, RouterError};
pub use events::{Event, EventKind, EventType, PhaseStatus, PipelineStatus};
pub use orchestrator::{
    AgentFailure, AggregateResult, Criticality, HaltPoint, Orchestrator, Phase, PhaseOutcome,
    Pipeline,
};
pub use router::{ModelRole, ModelRoute, ModelSelection, RoutingTable};
pub use telemetry::{init_tracing, LogFormat};
pub use tracker::ToolTracker;
