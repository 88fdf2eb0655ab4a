//! In-process publish/subscribe bus with bounded history.
//!
//! Handlers subscribe per [`EventType`] and are invoked in subscription order
//! for every event published after they subscribed. Each invocation is
//! isolated: an `Err` or a panic in one handler is logged and counted, and
//! delivery continues with the next handler.
//!
//! Delivery is serialized through a single pending queue, so every subscriber
//! observes events in publish order. A handler may publish from inside
//! `handle`; the nested event is queued and delivered once the current event
//! has reached all of its handlers.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::error::{panic_message, HandlerError};
use crate::events::{Event, EventKind, EventType};
use crate::metrics::METRICS;
use crate::obs::emit_handler_failed;

/// Default number of events retained in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Callback invoked for each delivered event.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SharedHandler = Arc<dyn EventHandler>;

struct BusState {
    next_seq: u64,
    next_subscription: u64,
    history: VecDeque<Event>,
    subscribers: BTreeMap<EventType, Vec<(SubscriptionId, SharedHandler)>>,
    pending: VecDeque<(Event, Vec<SharedHandler>)>,
    dispatching: bool,
}

struct BusInner {
    capacity: usize,
    state: Mutex<BusState>,
}

/// Cheaply cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("history_len", &self.history_len())
            .finish()
    }
}

impl EventBus {
    /// Create a bus retaining at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(BusInner {
                capacity,
                state: Mutex::new(BusState {
                    next_seq: 1,
                    next_subscription: 1,
                    history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
                    subscribers: BTreeMap::new(),
                    pending: VecDeque::new(),
                    dispatching: false,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Register a closure for every future event of `event_type`.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_handler(event_type, Arc::new(handler))
    }

    /// Register a shared [`EventHandler`] for every future event of `event_type`.
    pub fn subscribe_handler(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let mut state = self.state();
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        state
            .subscribers
            .entry(event_type)
            .or_default()
            .push((id, handler));
        debug!(event_type = %event_type, subscription = id.0, "handler subscribed");
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state();
        for handlers in state.subscribers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sid, _)| *sid == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.state()
            .subscribers
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Build and publish an event from `source`.
    pub fn emit(&self, source: impl Into<String>, kind: EventKind) -> u64 {
        self.publish(Event::new(source, kind))
    }

    /// Append `event` to history and deliver it to every handler subscribed
    /// to its type. Returns the sequence number assigned to the event.
    ///
    /// Never fails: handler errors and panics are contained here.
    pub fn publish(&self, mut event: Event) -> u64 {
        let seq = {
            let mut state = self.state();
            event.seq = state.next_seq;
            state.next_seq += 1;

            let handlers: Vec<SharedHandler> = state
                .subscribers
                .get(&event.event_type())
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();

            state.history.push_back(event.clone());
            while state.history.len() > self.inner.capacity {
                state.history.pop_front();
            }

            let seq = event.seq;
            debug!(
                seq,
                event_type = %event.event_type(),
                source = %event.source,
                "event published"
            );
            state.pending.push_back((event, handlers));
            METRICS.inc_events_published();

            if state.dispatching {
                // The active dispatcher drains the queue, including this event.
                return seq;
            }
            state.dispatching = true;
            seq
        };

        self.drain();
        seq
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut state = self.state();
                match state.pending.pop_front() {
                    Some(item) => item,
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };

            let (event, handlers) = next;
            for handler in handlers {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        METRICS.inc_handler_failures();
                        emit_handler_failed(event.seq, event.event_type(), &err);
                    }
                    Err(panic) => {
                        METRICS.inc_handler_failures();
                        let message = panic_message(panic.as_ref());
                        emit_handler_failed(
                            event.seq,
                            event.event_type(),
                            &HandlerError::new(format!("panic: {message}")),
                        );
                    }
                }
            }
            trace!(seq = event.seq, "event delivered");
        }
    }

    /// Snapshot of retained events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.state().history.iter().cloned().collect()
    }

    /// Retained events of a single type, oldest first.
    pub fn history_of(&self, event_type: EventType) -> Vec<Event> {
        self.state()
            .history
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.state().history.len()
    }
}
