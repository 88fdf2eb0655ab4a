//! Agent trait and execution lifecycle.
//!
//! An [`Agent`] supplies the work function. [`AgentRunner`] wraps it with the
//! lifecycle contract: `AgentStarted` on entry, retries with exponential
//! backoff, per-attempt timeout, cancellation, optional rollback, and exactly
//! one terminal `AgentCompleted` or `AgentFailed` event. Work failures never
//! propagate past [`AgentRunner::execute`]; they are folded into the returned
//! [`AgentResult`].

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::AgentPolicy;
use crate::context::{AgentContext, PipelineContext};
use crate::error::{panic_message, AgentError};
use crate::events::EventKind;
use crate::metrics::METRICS;
use crate::obs;

/// How long a rollback may keep running once cancellation has been requested.
pub const ROLLBACK_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
    Success,
    Failed,
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Failed,
}

/// One recorded call into an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub tool_name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Data returned by a successful work function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub data: Map<String, Value>,
    pub warnings: Vec<String>,
}

impl AgentOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Outcome of one agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub status: AgentStatus,
    pub data: Map<String, Value>,
    /// One entry per failed attempt, plus rollback failures.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub models_used: BTreeSet<String>,
    pub tools_called: Vec<ToolInvocationRecord>,
    /// Work attempts actually made.
    pub attempts: u32,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl AgentResult {
    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Success
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// A unit of pipeline work.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique name within a pipeline.
    fn name(&self) -> &str;

    /// Perform the work. Called once per attempt.
    async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError>;

    /// Undo partial effects after the execution has failed.
    async fn rollback(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Lifecycle wrapper around one agent instance.
pub struct AgentRunner {
    agent: Arc<dyn Agent>,
    policy: AgentPolicy,
    state: AgentState,
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner")
            .field("agent", &self.agent.name())
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish()
    }
}

impl AgentRunner {
    pub fn new(agent: Arc<dyn Agent>, policy: AgentPolicy) -> Self {
        Self {
            agent,
            policy,
            state: AgentState::Idle,
        }
    }

    pub fn name(&self) -> &str {
        self.agent.name()
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn policy(&self) -> &AgentPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: AgentPolicy) {
        self.policy = policy;
    }

    /// Run the agent to a terminal state.
    ///
    /// Taking `&mut self` makes a second concurrent execution of the same
    /// instance impossible.
    pub async fn execute(&mut self, pipeline: &PipelineContext) -> AgentResult {
        let name = self.agent.name().to_string();
        let started = Instant::now();
        let attempt_limit = self.policy.attempt_limit();
        self.state = AgentState::Running;

        pipeline.bus.emit(
            name.clone(),
            EventKind::AgentStarted {
                agent: name.clone(),
                attempt_limit,
            },
        );
        debug!(agent = %name, attempt_limit, "agent started");

        let ctx = AgentContext::new(name.clone(), pipeline);
        let mut errors = Vec::new();
        let mut output = None;
        let mut attempts = 0;

        for attempt in 1..=attempt_limit {
            attempts = attempt;
            ctx.set_attempt(attempt);
            match self.run_attempt(&ctx).await {
                Ok(out) => {
                    output = Some(out);
                    break;
                }
                Err(err) => {
                    obs::emit_agent_attempt_failed(&name, attempt, attempt_limit, &err);
                    let retryable = err.is_retryable();
                    errors.push(err.to_string());
                    if !retryable || attempt == attempt_limit {
                        break;
                    }
                    if let Err(cancelled) = self.backoff(&ctx, attempt).await {
                        errors.push(cancelled.to_string());
                        break;
                    }
                }
            }
        }

        if output.is_none() && self.policy.rollback_on_failure {
            if let Err(err) = self.run_rollback(&ctx).await {
                warn!(agent = %name, error = %err, "rollback failed");
                errors.push(format!("rollback failed: {err}"));
            }
        }

        let models_used = ctx.models_used();
        let tools_called = ctx.take_tool_records();

        let result = match output {
            Some(out) => {
                let duration = started.elapsed();
                self.state = AgentState::Success;
                info!(agent = %name, attempts, duration_ms = duration.as_millis() as u64, "agent completed");
                pipeline.bus.emit(
                    name.clone(),
                    EventKind::AgentCompleted {
                        agent: name.clone(),
                        status: AgentStatus::Success,
                        models_used: models_used.clone(),
                        tools_called: tools_called.clone(),
                        duration_ms: duration.as_millis() as u64,
                    },
                );
                AgentResult {
                    agent: name,
                    status: AgentStatus::Success,
                    data: out.data,
                    errors,
                    warnings: out.warnings,
                    models_used,
                    tools_called,
                    attempts,
                    duration,
                }
            }
            None => {
                let duration = started.elapsed();
                self.state = AgentState::Failed;
                warn!(agent = %name, attempts, errors = ?errors, "agent failed");
                pipeline.bus.emit(
                    name.clone(),
                    EventKind::AgentFailed {
                        agent: name.clone(),
                        errors: errors.clone(),
                        duration_ms: duration.as_millis() as u64,
                    },
                );
                AgentResult {
                    agent: name,
                    status: AgentStatus::Failed,
                    data: Map::new(),
                    errors,
                    warnings: Vec::new(),
                    models_used,
                    tools_called,
                    attempts,
                    duration,
                }
            }
        };

        METRICS.record_agent_execution(!result.is_success());
        result
    }

    /// One work attempt bounded by the policy timeout and the cancellation token.
    ///
    /// Dropping the work future on timeout or cancellation abandons any
    /// in-flight tool call.
    async fn run_attempt(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
        let work = catching_panics(self.agent.run(ctx));
        let bounded = self.bounded(ctx, work);

        tokio::select! {
            biased;
            _ = ctx.cancellation_token().cancelled() => Err(AgentError::Cancelled {
                reason: ctx.cancel_reason(),
            }),
            result = bounded => result,
        }
    }

    /// Roll back after the final failure, bounded by the policy timeout.
    ///
    /// Once cancellation is requested the rollback gets [`ROLLBACK_GRACE`] to
    /// finish before it is abandoned.
    async fn run_rollback(&self, ctx: &AgentContext) -> Result<(), AgentError> {
        let bounded = self.bounded(ctx, catching_panics(self.agent.rollback(ctx)));
        let grace = async {
            ctx.cancellation_token().cancelled().await;
            tokio::time::sleep(ROLLBACK_GRACE).await;
        };

        tokio::select! {
            result = bounded => result,
            _ = grace => Err(AgentError::Cancelled {
                reason: format!(
                    "{}; rollback abandoned after {}s grace",
                    ctx.cancel_reason(),
                    ROLLBACK_GRACE.as_secs()
                ),
            }),
        }
    }

    async fn bounded<T, F>(&self, ctx: &AgentContext, work: F) -> Result<T, AgentError>
    where
        F: std::future::Future<Output = Result<T, AgentError>>,
    {
        match self.policy.timeout() {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or_else(|_| {
                    Err(AgentError::Timeout {
                        agent: ctx.agent_name().to_string(),
                        timeout: limit,
                    })
                }),
            None => work.await,
        }
    }

    async fn backoff(&self, ctx: &AgentContext, attempt: u32) -> Result<(), AgentError> {
        let delay = self.policy.backoff_for(attempt);
        if delay.is_zero() {
            return Ok(());
        }
        debug!(agent = %ctx.agent_name(), delay_ms = delay.as_millis() as u64, "retry backoff");
        tokio::select! {
            biased;
            _ = ctx.cancellation_token().cancelled() => Err(AgentError::Cancelled {
                reason: ctx.cancel_reason(),
            }),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Turn a panic inside `work` into a failed attempt.
async fn catching_panics<T, F>(work: F) -> Result<T, AgentError>
where
    F: std::future::Future<Output = Result<T, AgentError>>,
{
    AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(AgentError::work(format!(
                "panic: {}",
                panic_message(panic.as_ref())
            )))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::router::RoutingTable;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_before_success: u32,
        calls: AtomicU32,
        rollbacks: AtomicU32,
    }

    impl Flaky {
        fn new(failures_before_success: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_before_success,
                calls: AtomicU32::new(0),
                rollbacks: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Agent for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(ctx.attempt(), n);
            if n <= self.failures_before_success {
                Err(AgentError::work(format!("failure #{n}")))
            } else {
                Ok(AgentOutput::new().with("calls", n).with_warning("slow disk"))
            }
        }

        async fn rollback(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pipeline() -> PipelineContext {
        PipelineContext::detached(RoutingTable::default())
    }

    #[tokio::test]
    async fn success_publishes_started_then_completed() {
        let p = pipeline();
        let agent = Flaky::new(0);
        let mut runner = AgentRunner::new(agent, AgentPolicy::once());
        assert_eq!(runner.state(), AgentState::Idle);

        let result = runner.execute(&p).await;
        assert!(result.is_success());
        assert_eq!(runner.state(), AgentState::Success);
        assert_eq!(result.data.get("calls"), Some(&Value::from(1)));
        assert_eq!(result.warnings, vec!["slow disk".to_string()]);

        let types: Vec<_> = p.bus.history().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::AgentStarted, EventType::AgentCompleted]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_keeps_attempt_errors() {
        let p = pipeline();
        let agent = Flaky::new(2);
        let policy = AgentPolicy::once()
            .with_max_retries(2)
            .with_retry_backoff_ms(1000);
        let mut runner = AgentRunner::new(agent.clone(), policy);

        let before = tokio::time::Instant::now();
        let result = runner.execute(&p).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("failure #1"));
        // 1s after the first failure, 2s after the second.
        assert!(before.elapsed() >= Duration::from_secs(3));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_roll_back() {
        let p = pipeline();
        let agent = Flaky::new(10);
        let policy = AgentPolicy::once().with_max_retries(1).with_rollback(true);
        let mut runner = AgentRunner::new(agent.clone(), policy);

        let result = runner.execute(&p).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(runner.state(), AgentState::Failed);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(agent.rollbacks.load(Ordering::SeqCst), 1);

        let failed = p.bus.history_of(EventType::AgentFailed);
        assert_eq!(failed.len(), 1);
        assert!(p.bus.history_of(EventType::AgentCompleted).is_empty());
    }

    struct Sleeper;

    #[async_trait]
    impl Agent for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
            ctx.invoke_tool("slow-api", || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, AgentError>(())
            })
            .await?;
            Ok(AgentOutput::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_and_records_abandoned_tool_call() {
        let p = pipeline();
        let policy = AgentPolicy::once().with_timeout_secs(Some(5));
        let mut runner = AgentRunner::new(Arc::new(Sleeper), policy);

        let result = runner.execute(&p).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert!(result.errors[0].contains("timed out"));
        assert_eq!(result.tools_called.len(), 1);
        assert!(!result.tools_called[0].succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_retried() {
        let p = pipeline();
        let policy = AgentPolicy::once().with_max_retries(3);
        let mut runner = AgentRunner::new(Arc::new(Sleeper), policy);

        let cancel = p.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel("operator abort");
        });

        let result = runner.execute(&p).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(
            result.errors,
            vec!["cancellation requested: operator abort".to_string()]
        );
    }

    #[test]
    fn result_serializes_duration_as_millis() {
        let result = AgentResult {
            agent: "a".to_string(),
            status: AgentStatus::Success,
            data: Map::new(),
            errors: vec![],
            warnings: vec![],
            models_used: BTreeSet::new(),
            tools_called: vec![],
            attempts: 1,
            duration: Duration::from_millis(1250),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 1250);
        assert_eq!(json["status"], "success");
    }

    struct Panicky;

    #[async_trait]
    impl Agent for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn run(&self, _ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
            panic!("disk vanished");
        }
    }

    #[tokio::test]
    async fn panic_in_work_is_a_failed_attempt() {
        let p = pipeline();
        let policy = AgentPolicy::once().with_max_retries(1);
        let mut runner = AgentRunner::new(Arc::new(Panicky), policy);

        let result = runner.execute(&p).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(runner.state(), AgentState::Failed);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.errors[0], "work failure: panic: disk vanished");
        assert_eq!(p.bus.history_of(EventType::AgentFailed).len(), 1);
    }

    /// Fails its work immediately and takes an hour to roll back.
    struct SlowRollback;

    #[async_trait]
    impl Agent for SlowRollback {
        fn name(&self) -> &str {
            "slow-rollback"
        }

        async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
            ctx.invoke_tool("deploy", || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err::<(), _>(AgentError::work("deploy failed"))
            })
            .await?;
            Ok(AgentOutput::new())
        }

        async fn rollback(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
            tokio::time::sleep(Duration::from_secs(36_000)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_after_cancellation_is_bounded_by_grace() {
        let p = pipeline();
        let policy = AgentPolicy::once().with_rollback(true);
        let mut runner = AgentRunner::new(Arc::new(SlowRollback), policy);

        let cancel = p.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel("operator abort");
        });

        let before = tokio::time::Instant::now();
        let result = runner.execute(&p).await;
        assert!(before.elapsed() < Duration::from_secs(60));
        assert!(before.elapsed() >= ROLLBACK_GRACE);
        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[1].starts_with("rollback failed"));
        assert!(result.errors[1].contains("rollback abandoned"));
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_is_bounded_by_policy_timeout() {
        let p = pipeline();
        let policy = AgentPolicy::once()
            .with_timeout_secs(Some(5))
            .with_rollback(true);
        let mut runner = AgentRunner::new(Arc::new(SlowRollback), policy);

        let before = tokio::time::Instant::now();
        let result = runner.execute(&p).await;
        // 5s for the work attempt, 5s for the rollback.
        assert!(before.elapsed() < Duration::from_secs(11));
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("timed out"));
        assert!(result.errors[1].starts_with("rollback failed"));
        assert!(result.errors[1].contains("timed out"));
    }
}
