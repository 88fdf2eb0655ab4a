//! Structured observability hooks for pipeline lifecycle events.
//!
//! This module provides:
//! - A pipeline-scoped tracing span (`PipelineSpan`) attached to each run
//! - Emission functions for pipeline start/finish, phase completion,
//!   failed agent attempts and handler failures
//!
//! These complement the [`EventBus`](crate::bus::EventBus): bus events are for
//! in-process subscribers, these lines are for log aggregation.

use tracing::{info, warn, Instrument};

use crate::error::HandlerError;
use crate::events::{EventType, PhaseStatus, PipelineStatus};

/// Pipeline-scoped tracing span for one run.
///
/// The span is attached to the run future with [`PipelineSpan::instrument`]
/// rather than entered, so it follows the run across await points.
///
/// # Example
///
/// ```ignore
/// let span = PipelineSpan::new("3f2c...", "migration");
/// span.instrument(async { /* tracing calls carry run_id and pipeline */ }).await;
/// ```
pub struct PipelineSpan {
    span: tracing::Span,
}

impl PipelineSpan {
    pub fn new(run_id: &str, pipeline: &str) -> Self {
        Self {
            span: tracing::info_span!("cloudify.pipeline", run_id = %run_id, pipeline = %pipeline),
        }
    }

    pub fn instrument<F: std::future::Future>(&self, future: F) -> tracing::instrument::Instrumented<F> {
        future.instrument(self.span.clone())
    }
}

pub fn emit_pipeline_started(run_id: &str, phases: usize, agents: usize) {
    info!(event = "pipeline.started", run_id = %run_id, phases, agents);
}

pub fn emit_pipeline_finished(run_id: &str, status: PipelineStatus, duration_ms: u64) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        status = %status,
        duration_ms,
    );
}

pub fn emit_phase_finished(phase: &str, status: PhaseStatus, failed_agents: &[String]) {
    info!(
        event = "phase.finished",
        phase = %phase,
        status = ?status,
        failed_agents = ?failed_agents,
    );
}

/// Emit event: one work attempt of an agent failed (warning level).
pub fn emit_agent_attempt_failed(agent: &str, attempt: u32, attempt_limit: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "agent.attempt_failed",
        agent = %agent,
        attempt,
        attempt_limit,
        error = %error,
    );
}

/// Emit event: an event handler returned an error or panicked (warning level).
pub fn emit_handler_failed(seq: u64, event_type: EventType, error: &HandlerError) {
    warn!(
        event = "bus.handler_failed",
        seq,
        event_type = %event_type,
        error = %error,
    );
}
