//! Error taxonomy for the orchestration engine.
//!
//! Agent-level failures ([`AgentError`]) never escape the lifecycle wrapper;
//! they are folded into a failed [`AgentResult`](crate::agent::AgentResult).
//! Pipeline-level errors ([`PipelineError`]) are raised only before the first
//! phase launches, when the pipeline definition itself is invalid.

use std::time::Duration;

use crate::router::ModelRole;

/// Failures raised while an agent is executing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// The agent's work function reported a failure.
    #[error("work failure: {0}")]
    WorkFailure(String),

    #[error("agent {agent} timed out after {}ms", timeout.as_millis())]
    Timeout { agent: String, timeout: Duration },

    #[error("cancellation requested: {reason}")]
    Cancelled { reason: String },

    #[error("model escalation exhausted for role {role} after {attempts} model(s): {last_reason}")]
    EscalationExhausted {
        role: ModelRole,
        attempts: usize,
        last_reason: String,
    },

    #[error("tool '{tool_name}' failed: {message}")]
    ToolFailed { tool_name: String, message: String },
}

impl AgentError {
    /// Convenience constructor for [`AgentError::WorkFailure`].
    pub fn work(message: impl Into<String>) -> Self {
        Self::WorkFailure(message.into())
    }

    /// Whether another attempt may be made after this error.
    ///
    /// Cancellation is terminal for the whole execution; every other variant
    /// is eligible for the retry policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled { .. })
    }
}

impl From<RouterError> for AgentError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::EscalationExhausted {
                role,
                attempts,
                last_reason,
            } => Self::EscalationExhausted {
                role,
                attempts,
                last_reason,
            },
            other => Self::WorkFailure(other.to_string()),
        }
    }
}

/// Errors from the model/escalation router.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("no route configured for role {0}")]
    UnknownRole(ModelRole),

    #[error("model escalation exhausted for role {role} after {attempts} model(s): {last_reason}")]
    EscalationExhausted {
        role: ModelRole,
        attempts: usize,
        last_reason: String,
    },
}

/// Errors raised while validating a pipeline before execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline has no phases")]
    EmptyPipeline,

    #[error("phase '{phase}' lists no agents")]
    EmptyPhase { phase: String },

    #[error("phase name '{phase}' is used more than once")]
    DuplicatePhase { phase: String },

    #[error("phase '{phase}' references unregistered agent '{agent}'")]
    UnknownAgent { phase: String, agent: String },

    #[error("agent '{agent}' is scheduled more than once (phases '{first}' and '{second}')")]
    DuplicateAgent {
        agent: String,
        first: String,
        second: String,
    },

    #[error("agent '{agent}' is already registered")]
    AlreadyRegistered { agent: String },
}

/// Failure returned by an event handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_retryable() {
        let err = AgentError::Cancelled {
            reason: "interrupt".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(AgentError::work("boom").is_retryable());
        assert!(AgentError::Timeout {
            agent: "a".to_string(),
            timeout: Duration::from_secs(1),
        }
        .is_retryable());
    }

    #[test]
    fn timeout_display_includes_millis() {
        let err = AgentError::Timeout {
            agent: "infra".to_string(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "agent infra timed out after 1500ms");
    }

    #[test]
    fn router_exhaustion_maps_to_agent_exhaustion() {
        let err: AgentError = RouterError::EscalationExhausted {
            role: ModelRole::Fast,
            attempts: 3,
            last_reason: "rate limited".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            AgentError::EscalationExhausted { attempts: 3, .. }
        ));
    }

    #[test]
    fn pipeline_error_messages() {
        let err = PipelineError::UnknownAgent {
            phase: "analysis".to_string(),
            agent: "ghost".to_string(),
        };
        assert!(err.to_string().contains("ghost"));
        assert!(err.to_string().contains("analysis"));
    }
}
