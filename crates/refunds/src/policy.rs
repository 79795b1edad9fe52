use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Penalty rule carried by a booking's policy snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PolicyKind {
    /// Penalty is `value` percent of the gross sell.
    Percent(Decimal),
    /// Penalty is a fixed amount in booking currency.
    Fixed(Decimal),
    /// Non-refundable once at least one night is penalized.
    Nights(u32),
    /// A policy type this engine does not interpret.
    Unknown(String),
}

/// Cancellation policy frozen into the booking at confirmation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub kind: PolicyKind,
    /// Free cancellation before this instant.
    pub free_until: Option<DateTime<Utc>>,
    /// Identifier of the policy the snapshot was taken from.
    pub reference: Option<String>,
}

impl CancellationPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            free_until: None,
            reference: None,
        }
    }

    pub fn with_free_until(mut self, at: DateTime<Utc>) -> Self {
        self.free_until = Some(at);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Read a booking document's `policy_snapshot`.
    ///
    /// Expected shape: `{"type": "percent", "value": 20, "free_until": ..., "id": ...}`.
    /// Returns `None` for null/empty snapshots; unreadable types or values
    /// become [`PolicyKind::Unknown`] so the calculator can fall back to basis
    /// `none` instead of failing the refund.
    pub fn from_snapshot(snapshot: &JsonValue) -> Option<Self> {
        let obj = snapshot.as_object()?;
        if obj.is_empty() {
            return None;
        }

        let kind_name = obj.get("type").and_then(JsonValue::as_str).unwrap_or_default();
        let value = obj.get("value").and_then(decimal_of);
        let kind = match (kind_name, value) {
            ("percent", Some(v)) => PolicyKind::Percent(v),
            ("fixed", Some(v)) => PolicyKind::Fixed(v),
            ("nights", Some(v)) => PolicyKind::Nights(v.trunc().to_u32().unwrap_or(0)),
            (other, _) => PolicyKind::Unknown(other.to_string()),
        };

        let free_until = obj
            .get("free_until")
            .and_then(JsonValue::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));

        let reference = obj.get("id").and_then(|v| match v {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        });

        Some(Self {
            kind,
            free_until,
            reference,
        })
    }
}

fn decimal_of(value: &JsonValue) -> Option<Decimal> {
    match value {
        JsonValue::Number(n) => n.to_string().parse().ok(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
