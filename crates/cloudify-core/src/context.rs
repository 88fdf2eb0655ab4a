//! Run-scoped context objects.
//!
//! A [`PipelineContext`] is created when a pipeline run starts and handed to
//! every component that publishes events or observes cancellation. Each agent
//! execution derives an [`AgentContext`] from it.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::agent::ToolInvocationRecord;
use crate::bus::EventBus;
use crate::error::AgentError;
use crate::events::EventKind;
use crate::metrics::METRICS;
use crate::router::{ModelRole, ModelSelection, RoutingTable};
use crate::tracker::ToolTracker;

const DEFAULT_CANCEL_REASON: &str = "pipeline cancelled";

/// Cloneable handle that requests cancellation of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first recorded reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Shared state of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub run_id: Uuid,
    pub bus: EventBus,
    pub routing: Arc<RoutingTable>,
    pub cancel: CancelHandle,
}

impl PipelineContext {
    pub fn new(bus: EventBus, routing: Arc<RoutingTable>, cancel: CancelHandle) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            bus,
            routing,
            cancel,
        }
    }

    /// A standalone context with a fresh bus and cancel handle (for one-off executions).
    pub fn detached(routing: RoutingTable) -> Self {
        Self::new(EventBus::default(), Arc::new(routing), CancelHandle::new())
    }
}

/// Per-execution context handed to [`Agent::run`](crate::agent::Agent::run).
///
/// Collects the tool invocations and models used during the execution so the
/// lifecycle wrapper can report them.
pub struct AgentContext {
    agent: String,
    pipeline: PipelineContext,
    token: CancellationToken,
    tracker: ToolTracker,
    models_used: Mutex<BTreeSet<String>>,
    attempt: AtomicU32,
}

impl AgentContext {
    pub fn new(agent: impl Into<String>, pipeline: &PipelineContext) -> Self {
        let agent = agent.into();
        Self {
            tracker: ToolTracker::new(agent.clone(), pipeline.bus.clone()),
            token: pipeline.cancel.token().child_token(),
            agent,
            pipeline: pipeline.clone(),
            models_used: Mutex::new(BTreeSet::new()),
            attempt: AtomicU32::new(0),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent
    }

    pub fn run_id(&self) -> Uuid {
        self.pipeline.run_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.pipeline.bus
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.pipeline.routing
    }

    /// 1-based number of the attempt currently running.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    pub(crate) fn set_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::Relaxed);
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel_reason(&self) -> String {
        self.pipeline.cancel.reason()
    }

    /// Yield to the scheduler and fail fast if cancellation was requested.
    pub async fn checkpoint(&self) -> Result<(), AgentError> {
        tokio::task::yield_now().await;
        if self.is_cancelled() {
            return Err(AgentError::Cancelled {
                reason: self.cancel_reason(),
            });
        }
        Ok(())
    }

    /// Invoke an external tool through the tracker.
    pub async fn invoke_tool<F, Fut, T, E>(&self, tool_name: &str, thunk: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.tracker.invoke(tool_name, thunk).await
    }

    pub fn tracker(&self) -> &ToolTracker {
        &self.tracker
    }

    /// Route `role` to its primary model and record the model as used.
    pub fn select_model(&self, role: ModelRole) -> Result<ModelSelection, AgentError> {
        let selection = self.pipeline.routing.route(role)?;
        self.record_model(&selection.model);
        Ok(selection)
    }

    /// Move to the next model in the fallback chain, publishing `ModelHandoff`.
    pub fn escalate_model(
        &self,
        current: &ModelSelection,
        reason: &str,
    ) -> Result<ModelSelection, AgentError> {
        let next = self.pipeline.routing.escalate(current, reason)?;
        METRICS.inc_model_escalations();
        info!(
            agent = %self.agent,
            role = %current.role,
            from = %current.model,
            to = %next.model,
            reason = %reason,
            "model handoff"
        );
        self.record_model(&next.model);
        self.pipeline.bus.emit(
            self.agent.clone(),
            EventKind::ModelHandoff {
                agent: self.agent.clone(),
                role: current.role,
                from_model: current.model.clone(),
                to_model: next.model.clone(),
                reason: reason.to_string(),
            },
        );
        Ok(next)
    }

    /// Call `call` with the routed model for `role`, escalating on each
    /// retryable failure until a call succeeds or the chain is exhausted.
    pub async fn with_model_fallback<F, Fut, T>(
        &self,
        role: ModelRole,
        mut call: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut(ModelSelection) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let mut selection = self.select_model(role)?;
        loop {
            match call(selection.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    selection = self.escalate_model(&selection, &err.to_string())?;
                }
            }
        }
    }

    pub fn record_model(&self, model: &str) {
        self.models_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.to_string());
    }

    pub fn models_used(&self) -> BTreeSet<String> {
        self.models_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn take_tool_records(&self) -> Vec<ToolInvocationRecord> {
        self.tracker.take_records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::router::ModelRoute;

    fn pipeline() -> PipelineContext {
        PipelineContext::detached(RoutingTable::empty().with_route(
            ModelRole::CodeGeneration,
            ModelRoute::new("m-primary", ["m-fallback"]),
        ))
    }

    #[test]
    fn cancel_handle_keeps_first_reason() {
        let handle = CancelHandle::new();
        assert_eq!(handle.reason(), DEFAULT_CANCEL_REASON);
        handle.cancel("user interrupt");
        handle.cancel("second");
        assert!(handle.is_cancelled());
        assert_eq!(handle.reason(), "user interrupt");
    }

    #[test]
    fn agent_token_is_child_of_pipeline_token() {
        let p = pipeline();
        let ctx = AgentContext::new("a", &p);
        assert!(!ctx.is_cancelled());
        p.cancel.cancel("stop");
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cancel_reason(), "stop");
    }

    #[tokio::test]
    async fn checkpoint_reports_cancellation() {
        let p = pipeline();
        let ctx = AgentContext::new("a", &p);
        assert!(ctx.checkpoint().await.is_ok());
        p.cancel.cancel("halt");
        assert_eq!(
            ctx.checkpoint().await,
            Err(AgentError::Cancelled {
                reason: "halt".to_string()
            })
        );
    }

    #[tokio::test]
    async fn model_fallback_escalates_and_records_handoff() {
        let p = pipeline();
        let ctx = AgentContext::new("codegen", &p);

        let model = ctx
            .with_model_fallback(ModelRole::CodeGeneration, |sel| async move {
                if sel.position == 0 {
                    Err(AgentError::work("rate limited"))
                } else {
                    Ok(sel.model)
                }
            })
            .await
            .unwrap();

        assert_eq!(model, "m-fallback");
        let used = ctx.models_used();
        assert!(used.contains("m-primary"));
        assert!(used.contains("m-fallback"));

        let handoffs = p.bus.history_of(EventType::ModelHandoff);
        assert_eq!(handoffs.len(), 1);
        match &handoffs[0].kind {
            EventKind::ModelHandoff {
                from_model,
                to_model,
                reason,
                ..
            } => {
                assert_eq!(from_model, "m-primary");
                assert_eq!(to_model, "m-fallback");
                assert!(reason.contains("rate limited"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn model_fallback_exhaustion_is_an_error() {
        let p = pipeline();
        let ctx = AgentContext::new("codegen", &p);
        let result: Result<(), _> = ctx
            .with_model_fallback(ModelRole::CodeGeneration, |_| async {
                Err(AgentError::work("down"))
            })
            .await;
        assert!(matches!(
            result,
            Err(AgentError::EscalationExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn model_fallback_stops_on_cancellation() {
        let p = pipeline();
        let ctx = AgentContext::new("codegen", &p);
        let result: Result<(), _> = ctx
            .with_model_fallback(ModelRole::CodeGeneration, |_| async {
                Err(AgentError::Cancelled {
                    reason: "stop".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(AgentError::Cancelled { .. })));
        assert!(p.bus.history_of(EventType::ModelHandoff).is_empty());
    }
}
