//! Agency credit ceilings: profiles and the pure limit decision.
//!
//! Serialization of check + reserve and the reserving posting live in
//! `waypost-infra::credit_guard`.

pub mod decision;
pub mod error;
pub mod event;
pub mod profile;

pub use decision::{CreditDecision, evaluate};
pub use error::CreditError;
pub use event::CreditEvent;
pub use profile::{CreditProfile, CreditStatus};
