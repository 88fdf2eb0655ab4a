//! Global atomic counters for orchestration observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a pipeline run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    events_published: AtomicU64,
    handler_failures: AtomicU64,
    agents_executed: AtomicU64,
    agent_failures: AtomicU64,
    tool_invocations: AtomicU64,
    model_escalations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            agents_executed: AtomicU64::new(0),
            agent_failures: AtomicU64::new(0),
            tool_invocations: AtomicU64::new(0),
            model_escalations: AtomicU64::new(0),
        }
    }

    pub fn inc_events_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "events_published", "counter incremented");
    }

    pub fn inc_handler_failures(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "handler_failures", "counter incremented");
    }

    /// Count one terminal agent execution; `failed` also bumps the failure counter.
    pub fn record_agent_execution(&self, failed: bool) {
        self.agents_executed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.agent_failures.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(metric = "agents_executed", failed, "counter incremented");
    }

    pub fn inc_tool_invocations(&self) {
        self.tool_invocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tool_invocations", "counter incremented");
    }

    pub fn inc_model_escalations(&self) {
        self.model_escalations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "model_escalations", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a pipeline run)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_published = self.events_published(),
            handler_failures = self.handler_failures(),
            agents_executed = self.agents_executed(),
            agent_failures = self.agent_failures(),
            tool_invocations = self.tool_invocations(),
            model_escalations = self.model_escalations(),
        );
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn agents_executed(&self) -> u64 {
        self.agents_executed.load(Ordering::Relaxed)
    }

    pub fn agent_failures(&self) -> u64 {
        self.agent_failures.load(Ordering::Relaxed)
    }

    pub fn tool_invocations(&self) -> u64 {
        self.tool_invocations.load(Ordering::Relaxed)
    }

    pub fn model_escalations(&self) -> u64 {
        self.model_escalations.load(Ordering::Relaxed)
    }
}
