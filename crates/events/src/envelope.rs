use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;
use crate::scope::AuditScope;

/// Envelope for an emitted event: scope, subject and metadata around the payload.
///
/// `subject` names the record the event is about (posting key, subscription id,
/// period label) so the audit trail can be filtered without decoding payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    scope: AuditScope,
    subject: String,
    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        scope: AuditScope,
        subject: impl Into<String>,
        event_type: impl Into<String>,
        event_version: u32,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            scope,
            subject: subject.into(),
            event_type: event_type.into(),
            event_version,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn scope(&self) -> AuditScope {
        self.scope
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<serde_json::Value> {
    /// Wrap a typed event, serializing its payload to JSON.
    pub fn from_event<E>(
        scope: AuditScope,
        subject: impl Into<String>,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(
            scope,
            subject,
            event.event_type(),
            event.version(),
            event.occurred_at(),
            payload,
        ))
    }
}
