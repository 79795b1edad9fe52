//! Write-only audit trail.
//!
//! `record` has no error channel: sinks log their own failures and return.
//! Callers emit after the financial write committed.

use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::envelope::EventEnvelope;
use crate::event::Event;
use crate::scope::AuditScope;

/// Fire-and-forget, append-only audit log.
pub trait AuditSink: Send + Sync {
    fn record(&self, envelope: EventEnvelope<JsonValue>);
}

impl<S> AuditSink for std::sync::Arc<S>
where
    S: AuditSink + ?Sized,
{
    fn record(&self, envelope: EventEnvelope<JsonValue>) {
        (**self).record(envelope)
    }
}

/// Serialize `event` and hand it to `sink`; serialization failures are logged
/// and dropped.
pub fn emit<E>(sink: &dyn AuditSink, scope: AuditScope, subject: impl Into<String>, event: &E)
where
    E: Event + Serialize,
{
    match EventEnvelope::from_event(scope, subject, event) {
        Ok(envelope) => sink.record(envelope),
        Err(err) => warn!(
            event_type = event.event_type(),
            error = %err,
            "audit payload serialization failed; record dropped"
        ),
    }
}

/// Publishes audit records to an [`EventBus`].
#[derive(Debug)]
pub struct BusAuditSink<B> {
    bus: B,
}

impl<B> BusAuditSink<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> AuditSink for BusAuditSink<B>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn record(&self, envelope: EventEnvelope<JsonValue>) {
        let event_type = envelope.event_type().to_string();
        if let Err(err) = self.bus.publish(envelope) {
            warn!(event_type = %event_type, error = ?err, "audit publish failed");
        }
    }
}

/// Writes audit records to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, envelope: EventEnvelope<JsonValue>) {
        info!(
            target: "audit",
            event_id = %envelope.event_id(),
            scope = ?envelope.scope(),
            subject = envelope.subject(),
            event_type = envelope.event_type(),
            payload = %envelope.payload(),
            "audit"
        );
    }
}

/// Keeps every record in memory (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<EventEnvelope<JsonValue>>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventEnvelope<JsonValue>> {
        match self.records.lock() {
            Ok(r) => r.clone(),
            Err(_) => vec![],
        }
    }

    pub fn of_type(&self, event_type: &str) -> Vec<EventEnvelope<JsonValue>> {
        self.records()
            .into_iter()
            .filter(|r| r.event_type() == event_type)
            .collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, envelope: EventEnvelope<JsonValue>) {
        if let Ok(mut r) = self.records.lock() {
            r.push(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_bus::InMemoryEventBus;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use waypost_core::OrgId;

    #[derive(Debug, Clone, Serialize)]
    struct Touched {
        at: DateTime<Utc>,
    }

    impl Event for Touched {
        fn event_type(&self) -> &'static str {
            "test.touched"
        }

        fn version(&self) -> u32 {
            1
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn emit_wraps_event_metadata() {
        let sink = RecordingAuditSink::new();
        let org = OrgId::new();
        emit(&sink, AuditScope::Org(org), "thing/1", &Touched { at: Utc::now() });

        let records = sink.of_type("test.touched");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].scope().org_id(), Some(org));
        assert_eq!(records[0].subject(), "thing/1");
        assert_eq!(records[0].event_version(), 1);
    }

    #[test]
    fn bus_sink_fans_out_to_subscribers() {
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let sink = BusAuditSink::new(bus.clone());

        emit(&sink, AuditScope::System, "period/2026-09", &Touched { at: Utc::now() });

        let got = sub.try_recv().unwrap();
        assert_eq!(got.event_type(), "test.touched");
    }
}
