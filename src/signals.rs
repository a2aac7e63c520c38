//! Lifecycle signals and the synchronous bus that dispatches them.
//!
//! Handlers run inline, in registration order, on whatever worker caused the
//! event. A panicking handler is logged and skipped; it never takes the
//! worker down or stops later handlers from running.

use crate::error::TaskError;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A task lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Task moved to the schedule store
    Scheduled,
    /// Task body is about to run
    Executing,
    /// Task body returned normally
    Complete,
    /// Task body failed
    Error,
    /// Failed task is being retried
    Retrying,
    /// Task was revoked and dropped
    Revoked,
    /// Task body could not take a lock
    Locked,
    /// Task expired before it ran
    Expired,
    /// Execution was cancelled by a hook or the body
    Canceled,
    /// Execution was dropped by an immediate shutdown
    Interrupted,
}

impl Signal {
    /// Every signal, in declaration order.
    pub const ALL: [Signal; 10] = [
        Signal::Scheduled,
        Signal::Executing,
        Signal::Complete,
        Signal::Error,
        Signal::Retrying,
        Signal::Revoked,
        Signal::Locked,
        Signal::Expired,
        Signal::Canceled,
        Signal::Interrupted,
    ];

    /// Lowercase signal name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Scheduled => "scheduled",
            Signal::Executing => "executing",
            Signal::Complete => "complete",
            Signal::Error => "error",
            Signal::Retrying => "retrying",
            Signal::Revoked => "revoked",
            Signal::Locked => "locked",
            Signal::Expired => "expired",
            Signal::Canceled => "canceled",
            Signal::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler receives.
#[derive(Debug, Clone, Copy)]
pub struct SignalEvent<'a> {
    /// The event
    pub signal: Signal,
    /// The task it concerns
    pub task: &'a Task,
    /// Return value, for [`Signal::Complete`]
    pub value: Option<&'a Value>,
    /// Failure, for [`Signal::Error`] and [`Signal::Locked`]
    pub error: Option<&'a TaskError>,
}

impl<'a> SignalEvent<'a> {
    /// An event without payload.
    pub fn new(signal: Signal, task: &'a Task) -> Self {
        Self {
            signal,
            task,
            value: None,
            error: None,
        }
    }
}

/// Signal callback.
pub type SignalHandler = Arc<dyn Fn(&SignalEvent<'_>) + Send + Sync>;

/// Identifies a connected handler, for disconnecting it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Ordered handler lists per signal.
pub struct SignalBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<Signal, Vec<(HandlerId, SignalHandler)>>>,
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<Signal, usize> = handlers.iter().map(|(s, h)| (*s, h.len())).collect();
        f.debug_struct("SignalBus").field("handlers", &counts).finish()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Connect `handler` to `signals`; an empty slice means every signal.
    pub fn connect<F>(&self, signals: &[Signal], handler: F) -> HandlerId
    where
        F: Fn(&SignalEvent<'_>) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: SignalHandler = Arc::new(handler);
        let targets: &[Signal] = if signals.is_empty() {
            &Signal::ALL
        } else {
            signals
        };

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for signal in targets {
            let list = handlers.entry(*signal).or_default();
            if !list.iter().any(|(existing, _)| *existing == id) {
                list.push((id, Arc::clone(&handler)));
            }
        }
        id
    }

    /// Disconnect `id` from `signal`, or from every signal when `None`.
    /// Returns whether anything was removed.
    pub fn disconnect(&self, id: HandlerId, signal: Option<Signal>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for (candidate, list) in handlers.iter_mut() {
            if signal.is_some_and(|s| s != *candidate) {
                continue;
            }
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of handlers attached to `signal`.
    pub fn handler_count(&self, signal: Signal) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&signal)
            .map_or(0, Vec::len)
    }

    /// Dispatch `event` to its handlers, in registration order.
    pub fn send(&self, event: &SignalEvent<'_>) {
        let handlers: Vec<(HandlerId, SignalHandler)> = {
            let guard = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            match guard.get(&event.signal) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(
                    "Signal handler {:?} panicked on '{}' for task {}",
                    id,
                    event.signal,
                    event.task.id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> SignalHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |label: &str| -> SignalHandler {
            let log = Arc::clone(&log_clone);
            let label = label.to_string();
            Arc::new(move |event: &SignalEvent<'_>| {
                log.lock()
                    .unwrap()
                    .push(format!("{}:{}", label, event.signal));
            })
        };
        (log, make)
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = SignalBus::new();
        let (log, make) = recorder();
        let first = make("a");
        let second = make("b");
        bus.connect(&[Signal::Complete], move |e| first(e));
        bus.connect(&[], move |e| second(e));

        let task = Task::new("t", Value::Null);
        bus.send(&SignalEvent::new(Signal::Complete, &task));
        bus.send(&SignalEvent::new(Signal::Error, &task));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:complete", "b:complete", "b:error"]
        );
    }

    #[test]
    fn test_disconnect_single_signal_and_all() {
        let bus = SignalBus::new();
        let (log, make) = recorder();
        let handler = make("h");
        let id = bus.connect(&[Signal::Complete, Signal::Error], move |e| handler(e));
        let task = Task::new("t", Value::Null);

        assert!(bus.disconnect(id, Some(Signal::Complete)));
        bus.send(&SignalEvent::new(Signal::Complete, &task));
        bus.send(&SignalEvent::new(Signal::Error, &task));
        assert_eq!(*log.lock().unwrap(), vec!["h:error"]);

        assert!(bus.disconnect(id, None));
        assert!(!bus.disconnect(id, None));
        bus.send(&SignalEvent::new(Signal::Error, &task));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(bus.handler_count(Signal::Error), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_dispatch() {
        let bus = SignalBus::new();
        let (log, make) = recorder();
        let after = make("after");
        bus.connect(&[Signal::Executing], |_| panic!("handler failure"));
        bus.connect(&[Signal::Executing], move |e| after(e));

        let task = Task::new("t", Value::Null);
        bus.send(&SignalEvent::new(Signal::Executing, &task));
        assert_eq!(*log.lock().unwrap(), vec!["after:executing"]);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::Scheduled.to_string(), "scheduled");
        assert_eq!(Signal::ALL.len(), 10);
        assert_eq!(
            serde_json::to_string(&Signal::Interrupted).unwrap(),
            "\"interrupted\""
        );
    }
}
