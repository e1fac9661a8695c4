//! Typed circuit breaker events
//!
//! Events are published on a `tokio::sync::broadcast` channel. A slow or dropped
//! subscriber only loses its own messages; publishing never blocks and never fails
//! the call that emitted the event.

use crate::circuit_breaker::{CircuitState, TransitionReason};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Discriminant used to filter events on the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerEventType {
    StateChange,
    CallSuccess,
    CallFailure,
    CallTimeout,
    FallbackExecuted,
}

/// Payload of a circuit breaker event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CircuitBreakerEventKind {
    StateChange {
        from: CircuitState,
        to: CircuitState,
        reason: TransitionReason,
    },
    CallSuccess {
        response_time_ms: f64,
    },
    /// `response_time_ms` is `None` when the call was rejected without running
    CallFailure {
        error: String,
        response_time_ms: Option<f64>,
    },
    CallTimeout {
        timeout_ms: u64,
    },
    FallbackExecuted {
        success: bool,
        error: Option<String>,
    },
}

impl CircuitBreakerEventKind {
    pub fn event_type(&self) -> CircuitBreakerEventType {
        match self {
            Self::StateChange { .. } => CircuitBreakerEventType::StateChange,
            Self::CallSuccess { .. } => CircuitBreakerEventType::CallSuccess,
            Self::CallFailure { .. } => CircuitBreakerEventType::CallFailure,
            Self::CallTimeout { .. } => CircuitBreakerEventType::CallTimeout,
            Self::FallbackExecuted { .. } => CircuitBreakerEventType::FallbackExecuted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerEvent {
    pub event_id: Uuid,
    pub circuit_breaker: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: CircuitBreakerEventKind,
}

impl CircuitBreakerEvent {
    pub fn event_type(&self) -> CircuitBreakerEventType {
        self.kind.event_type()
    }
}

/// Fan-out of events to any number of subscribers
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    name: String,
    sender: broadcast::Sender<CircuitBreakerEvent>,
    enabled: bool,
}

impl EventBus {
    const CAPACITY: usize = 256;

    pub(crate) fn new(name: impl Into<String>, enabled: bool) -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self {
            name: name.into(),
            sender,
            enabled,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CircuitBreakerEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, kind: CircuitBreakerEventKind) {
        if !self.enabled {
            return;
        }

        let event = CircuitBreakerEvent {
            event_id: Uuid::new_v4(),
            circuit_breaker: self.name.clone(),
            timestamp: Utc::now(),
            kind,
        };

        // No receivers is not an error for the emitter
        let _ = self.sender.send(event);
    }
}
