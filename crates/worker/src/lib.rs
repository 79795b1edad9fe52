//! Engine process: service wiring, audit fan-out and the finalize scheduler.

pub mod app;

pub use app::{Engine, Storage, build_engine, build_scheduler};
