//! Tool invocation tracking.
//!
//! [`ToolTracker::invoke`] wraps one call into an external collaborator
//! (cloud API, subprocess, model API), times it, appends a
//! [`ToolInvocationRecord`] to the invoking agent's running record list and
//! publishes a `ToolInvoked` event. The underlying result is returned
//! unchanged, so failures still reach the agent's own error handling.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::debug;

use crate::agent::ToolInvocationRecord;
use crate::bus::EventBus;
use crate::events::EventKind;
use crate::metrics::METRICS;

/// Per-execution recorder of tool calls made by one agent.
pub struct ToolTracker {
    agent: String,
    bus: EventBus,
    records: Mutex<Vec<ToolInvocationRecord>>,
}

impl ToolTracker {
    pub fn new(agent: impl Into<String>, bus: EventBus) -> Self {
        Self {
            agent: agent.into(),
            bus,
            records: Mutex::new(Vec::new()),
        }
    }

    fn records_mut(&self) -> MutexGuard<'_, Vec<ToolInvocationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `thunk`, recording its duration and outcome.
    ///
    /// If the returned future is dropped before `thunk` completes (timeout or
    /// cancellation), the call is still recorded as a failed invocation.
    pub async fn invoke<F, Fut, T, E>(&self, tool_name: &str, thunk: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut guard = InFlight {
            tracker: self,
            tool_name,
            started_at: Utc::now(),
            started: Instant::now(),
            finished: false,
        };

        let result = thunk().await;
        let error = result.as_ref().err().map(|e| e.to_string());
        guard.finish(error);
        result
    }

    fn record(&self, record: ToolInvocationRecord) {
        METRICS.inc_tool_invocations();
        debug!(
            agent = %self.agent,
            tool = %record.tool_name,
            duration_ms = record.duration_ms,
            succeeded = record.succeeded,
            "tool invoked"
        );
        let kind = EventKind::ToolInvoked {
            agent: self.agent.clone(),
            tool_name: record.tool_name.clone(),
            duration_ms: record.duration_ms,
            succeeded: record.succeeded,
        };
        // The lock is released before publishing so handlers may inspect the tracker.
        self.records_mut().push(record);
        self.bus.emit(self.agent.clone(), kind);
    }

    /// Snapshot of invocations recorded so far, in completion order.
    pub fn records(&self) -> Vec<ToolInvocationRecord> {
        self.records_mut().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.records_mut().len()
    }

    pub(crate) fn take_records(&self) -> Vec<ToolInvocationRecord> {
        std::mem::take(&mut *self.records_mut())
    }
}

struct InFlight<'a> {
    tracker: &'a ToolTracker,
    tool_name: &'a str,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
    finished: bool,
}

impl InFlight<'_> {
    fn finish(&mut self, error: Option<String>) {
        self.finished = true;
        self.tracker.record(ToolInvocationRecord {
            tool_name: self.tool_name.to_string(),
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            succeeded: error.is_none(),
            error,
        });
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Some("invocation cancelled before completion".to_string()));
        }
    }
}
