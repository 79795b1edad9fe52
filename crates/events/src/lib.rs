//! Domain events and the append-only audit trail.
//!
//! Financial operations describe what they did as typed events; the audit sink
//! receives them wrapped in an [`EventEnvelope`]. The sink is fire-and-forget:
//! a failing sink never rolls back or blocks the operation that emitted the
//! event.

pub mod audit;
pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod scope;

pub use audit::{AuditSink, BusAuditSink, RecordingAuditSink, TracingAuditSink, emit};
pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use scope::AuditScope;
