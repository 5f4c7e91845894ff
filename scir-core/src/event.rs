//! Events and the external event channel.

use crate::error::EventSendError;
use serde_json::Value;
use tokio::sync::mpsc;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Raised by executable content; consumed before any external event.
    Internal,
    /// Delivered by the environment (or by a delayed send).
    External,
}

/// An event. Created once, consumed exactly once by transition selection,
/// never mutated.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub data: Value,
    pub origin: EventOrigin,
    /// Correlates to a specific child invocation.
    pub invoke_id: Option<String>,
}

impl Event {
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
            origin: EventOrigin::Internal,
            invoke_id: None,
        }
    }

    pub fn internal_with(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            origin: EventOrigin::Internal,
            invoke_id: None,
        }
    }

    pub fn external(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            origin: EventOrigin::External,
            invoke_id: None,
        }
    }

    pub fn with_invoke_id(mut self, invoke_id: impl Into<String>) -> Self {
        self.invoke_id = Some(invoke_id.into());
        self
    }
}

/// Sending half of the external event channel. Clonable; the interpreter
/// owns the receiving half.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// Delivers an external event. Never blocks.
    pub fn send(&self, event: Event) -> Result<(), EventSendError> {
        self.tx.send(event).map_err(|_| EventSendError)
    }

    /// Convenience for a named event with no payload.
    pub fn send_named(&self, name: impl Into<String>) -> Result<(), EventSendError> {
        self.send(Event::external(name, Value::Null))
    }
}
