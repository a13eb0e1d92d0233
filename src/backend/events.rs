//! Audit events and the sinks that record them

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::EventSink;

/// What an audit event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TokenReserved,
    TokenReturned,
    AddressState,
    ConfigVlans,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::TokenReserved => "TOKEN_RESERVED",
            EventKind::TokenReturned => "TOKEN_RETURNED",
            EventKind::AddressState => "ADDRESS_STATE",
            EventKind::ConfigVlans => "CONFIG_VLANS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
}

/// A single leveled, free-text audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: EventKind,
    pub level: EventLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: EventKind, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            kind,
            level,
            cluster: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }
}

/// Renders audit events as tracing records at the event's level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: AuditEvent) {
        let cluster = event.cluster.as_deref().unwrap_or("-");
        match event.level {
            EventLevel::Debug => debug!(kind = %event.kind, cluster, "{}", event.message),
            EventLevel::Info => info!(kind = %event.kind, cluster, "{}", event.message),
            EventLevel::Warn => warn!(kind = %event.kind, cluster, "{}", event.message),
        }
    }
}

/// Keeps every event in memory, for status endpoints and tests
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_filters_by_kind() {
        let sink = RecordingEventSink::new();
        sink.record(AuditEvent::new(
            EventKind::TokenReserved,
            EventLevel::Info,
            "reserved",
        ));
        sink.record(
            AuditEvent::new(EventKind::AddressState, EventLevel::Warn, "orphan")
                .for_cluster("cluster-a"),
        );

        assert_eq!(sink.len(), 2);
        let address_events = sink.of_kind(EventKind::AddressState);
        assert_eq!(address_events.len(), 1);
        assert_eq!(address_events[0].cluster.as_deref(), Some("cluster-a"));
    }

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::ConfigVlans).unwrap();
        assert_eq!(json, "\"CONFIG_VLANS\"");
        assert_eq!(EventKind::TokenReturned.to_string(), "TOKEN_RETURNED");
    }
}
