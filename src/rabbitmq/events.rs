// src/rabbitmq/events.rs
//
// Structured log/success/error events. Every component reports through an
// `EventSink`; the default sink forwards to `tracing`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Log,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub service: String,
    pub message: String,
    pub data: Value,
    pub at: DateTime<Utc>,
}

/// Destination for events emitted by the messaging layer.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes events through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event.kind {
            EventKind::Error => error!(
                service = %event.service,
                data = %event.data,
                "{}",
                event.message
            ),
            EventKind::Success => info!(
                service = %event.service,
                data = %event.data,
                outcome = "success",
                "{}",
                event.message
            ),
            EventKind::Log => info!(
                service = %event.service,
                data = %event.data,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Error)
            .collect()
    }

    /// Events whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.message.contains(needle))
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// A sink bound to one service name.
#[derive(Clone)]
pub struct Reporter {
    service: &'static str,
    sink: Arc<dyn EventSink>,
}

impl Reporter {
    pub fn new(service: &'static str, sink: Arc<dyn EventSink>) -> Self {
        Self { service, sink }
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    pub fn log(&self, message: impl Into<String>, data: Value) {
        self.emit(EventKind::Log, message.into(), data);
    }

    pub fn success(&self, message: impl Into<String>, data: Value) {
        self.emit(EventKind::Success, message.into(), data);
    }

    pub fn error(&self, message: impl Into<String>, data: Value) {
        self.emit(EventKind::Error, message.into(), data);
    }

    fn emit(&self, kind: EventKind, message: String, data: Value) {
        self.sink.emit(Event {
            kind,
            service: self.service.to_string(),
            message,
            data,
            at: Utc::now(),
        });
    }
}
