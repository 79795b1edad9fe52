use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use waypost_core::Outcome;

use crate::error::EngineError;
use crate::store::StoreError;

/// Inputs of one scheduled run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    /// Scheduled fire time this run belongs to.
    pub due: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Identity of this scheduler instance, used as lock owner.
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub detail: String,
    /// Work remains; the scheduler retries the same due time.
    pub incomplete: bool,
}

impl JobReport {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            incomplete: false,
        }
    }

    pub fn incomplete(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            incomplete: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// A schedulable unit of work.
///
/// `Applied` means the job did its work, `AlreadyApplied` that there was
/// nothing left to do, `Rejected` that it declined to run (e.g. lock held).
/// An error, a held lock or an incomplete report is retried after the job's
/// retry interval.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &JobContext) -> Result<Outcome<JobReport>, JobError>;
}

/// Handlers by name. Built once, never mutated afterwards.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: Arc<BTreeMap<&'static str, Arc<dyn JobHandler>>>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct JobRegistryBuilder {
    handlers: BTreeMap<&'static str, Arc<dyn JobHandler>>,
}

impl JobRegistryBuilder {
    /// Register `handler` under its name. A second handler with the same
    /// name is an error.
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Result<Self, JobError> {
        let name = handler.name();
        if self.handlers.contains_key(name) {
            return Err(JobError::Failed(format!("job '{name}' registered twice")));
        }
        self.handlers.insert(name, handler);
        Ok(self)
    }

    pub fn build(self) -> JobRegistry {
        JobRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn run(&self, _ctx: &JobContext) -> Result<Outcome<JobReport>, JobError> {
            Ok(Outcome::Applied(JobReport::new("nothing")))
        }
    }

    #[test]
    fn duplicate_names_are_refused() {
        let builder = JobRegistry::builder().register(Arc::new(Noop)).unwrap();
        assert!(builder.register(Arc::new(Noop)).is_err());
    }

    #[test]
    fn built_registry_resolves_by_name() {
        let registry = JobRegistry::builder().register(Arc::new(Noop)).unwrap().build();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }
}
