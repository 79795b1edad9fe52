//! Dated FX rates and the snapshots that freeze one of them per business context.
//!
//! Rates are always expressed as quote units per 1 base unit.

pub mod error;
pub mod event;
pub mod rate;
pub mod snapshot;

pub use error::FxError;
pub use event::FxEvent;
pub use rate::{FxRate, latest_at};
pub use snapshot::{FxRateSnapshot, SnapshotKey, convert};
