use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A single structured audit record. Attributes are flat key/value pairs;
/// callers must only attach non-sensitive values (email domains, never
/// full addresses).
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub name: String,
    pub request_id: String,
    pub attributes: Vec<(String, String)>,
}

impl AuditEvent {
    pub fn new(name: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_id: request_id.into(),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

#[derive(Debug, Default)]
struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            target: "tracker.audit",
            event = %event.name,
            request_id = %event.request_id,
            attributes = ?event.attributes,
            "audit event",
        );
    }
}

/// Captures audit events in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

#[derive(Clone)]
pub struct Observability {
    sink: Arc<dyn AuditSink>,
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl Default for Observability {
    fn default() -> Self {
        Self::with_sink(Arc::new(TracingAuditSink))
    }
}

impl Observability {
    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn audit(&self, event: AuditEvent) {
        self.sink.record(&event);
    }

    pub fn increment_counter(&self, name: &str, request_id: &str) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counters.entry(name.to_string()).or_insert(0) += 1;
        tracing::debug!(
            target: "tracker.audit",
            counter = %name,
            request_id = %request_id,
            "counter incremented",
        );
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_captures_events_in_order() {
        let sink = Arc::new(RecordingAuditSink::default());
        let observability = Observability::with_sink(sink.clone());

        observability.audit(
            AuditEvent::new("newsletter.subscribe.requested", "req_1")
                .with_attribute("email_domain", "hollownest.example"),
        );
        observability.audit(AuditEvent::new("newsletter.confirm.completed", "req_2"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "newsletter.subscribe.requested");
        assert_eq!(
            events[0].attributes,
            vec![(
                "email_domain".to_string(),
                "hollownest.example".to_string()
            )]
        );
    }

    #[test]
    fn counters_accumulate_per_name() {
        let observability = Observability::default();
        observability.increment_counter("newsletter.subscribe.requested", "req_1");
        observability.increment_counter("newsletter.subscribe.requested", "req_2");

        assert_eq!(observability.counter("newsletter.subscribe.requested"), 2);
        assert_eq!(observability.counter("newsletter.confirm.completed"), 0);
    }
}
