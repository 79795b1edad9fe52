//! Monthly finalize scheduling.
//!
//! A [`Scheduler`] is built once at startup from an immutable [`JobRegistry`]
//! and driven either by [`Scheduler::tick`] (tests) or by the task started
//! with [`Scheduler::start`].

pub mod finalize;
pub mod job;
pub mod runner;
pub mod schedule;

pub use finalize::{FinalizeRun, MonthlyFinalizeHandler};
pub use job::{JobContext, JobError, JobHandler, JobRegistry, JobRegistryBuilder, JobReport};
pub use runner::{JobRun, JobState, ScheduledJob, Scheduler, SchedulerHandle};
pub use schedule::MonthlySchedule;
