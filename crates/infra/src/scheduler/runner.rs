use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use waypost_core::{Outcome, RejectionKind};

use super::job::{JobContext, JobRegistry, JobReport};
use super::schedule::MonthlySchedule;

/// A registered handler bound to its trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub name: String,
    pub schedule: MonthlySchedule,
    pub enabled: bool,
    /// A trigger noticed later than this after its due time is skipped.
    pub misfire_grace: Duration,
    /// Wait between attempts at a due time whose run left work behind.
    pub retry_interval: Duration,
}

/// Runtime state of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobState {
    /// Latest due time that is done (completed or skipped as misfire).
    pub last_fired: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub running: bool,
    /// Due time being retried, and when the next attempt may start.
    pub retry_due: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
}

/// What one tick did for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub job: String,
    pub due: Option<DateTime<Utc>>,
    pub result: Result<Outcome<JobReport>, String>,
}

/// Cron-like driver for monthly jobs.
///
/// At most one successful run per due time: a tick that finds the due time
/// already fired does nothing, so overlapping or repeated ticks coalesce. A
/// run that errors, finds the lock held or reports leftover work keeps its due
/// time open and is retried every `retry_interval`.
pub struct Scheduler {
    registry: JobRegistry,
    jobs: Vec<ScheduledJob>,
    owner: String,
    tick_interval: std::time::Duration,
    state: Arc<Mutex<BTreeMap<String, JobState>>>,
}

impl Scheduler {
    pub fn new(
        registry: JobRegistry,
        jobs: Vec<ScheduledJob>,
        owner: impl Into<String>,
        tick_interval: std::time::Duration,
    ) -> Self {
        let state = jobs
            .iter()
            .map(|j| (j.name.clone(), JobState::default()))
            .collect();
        Self {
            registry,
            jobs,
            owner: owner.into(),
            tick_interval,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BTreeMap<String, JobState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> BTreeMap<String, JobState> {
        self.lock_state().clone()
    }

    /// Evaluate every job against `now` and run the ones that are due.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JobRun> {
        let mut runs = Vec::new();
        for job in &self.jobs {
            if let Some(run) = self.tick_job(job, now).await {
                runs.push(run);
            }
        }
        runs
    }

    async fn tick_job(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Option<JobRun> {
        if !job.enabled {
            debug!(job = %job.name, "job disabled");
            return Some(JobRun {
                job: job.name.clone(),
                due: None,
                result: Ok(Outcome::rejected(RejectionKind::Disabled, "disabled by configuration")),
            });
        }
        let due = job.schedule.latest_due(now)?;

        {
            let mut state = self.lock_state();
            let entry = state.entry(job.name.clone()).or_default();
            if entry.running || entry.last_fired.is_some_and(|fired| fired >= due) {
                return None;
            }
            let retrying = entry.retry_due == Some(due);
            if retrying && entry.retry_at.is_some_and(|at| now < at) {
                return None;
            }
            if !retrying && now - due > job.misfire_grace {
                warn!(job = %job.name, %due, %now, "trigger misfired, skipping until next schedule");
                let outcome = Outcome::rejected(RejectionKind::Misfired, format!("due {due}, noticed {now}"));
                entry.last_fired = Some(due);
                entry.last_result = Some(outcome.label().to_string());
                return Some(JobRun {
                    job: job.name.clone(),
                    due: Some(due),
                    result: Ok(outcome),
                });
            }
            entry.running = true;
        }

        let result = match self.registry.get(&job.name) {
            None => Err(format!("no handler registered for '{}'", job.name)),
            Some(handler) => {
                let ctx = JobContext {
                    due,
                    started_at: now,
                    owner: self.owner.clone(),
                };
                info!(job = %job.name, %due, "running scheduled job");
                handler.run(&ctx).await.map_err(|e| e.to_string())
            }
        };

        let label = match &result {
            Ok(outcome) => {
                info!(job = %job.name, result = outcome.label(), "scheduled job finished");
                outcome.label().to_string()
            }
            Err(e) => {
                error!(job = %job.name, error = %e, "scheduled job failed");
                format!("error: {e}")
            }
        };
        let mut state = self.lock_state();
        let entry = state.entry(job.name.clone()).or_default();
        entry.running = false;
        entry.last_run_at = Some(now);
        entry.last_result = Some(label);
        if needs_retry(&result) {
            let retry_at = now + job.retry_interval;
            warn!(job = %job.name, %due, %retry_at, "run left work behind, retry scheduled");
            entry.retry_due = Some(due);
            entry.retry_at = Some(retry_at);
        } else {
            entry.last_fired = Some(due);
            entry.retry_due = None;
            entry.retry_at = None;
        }

        Some(JobRun {
            job: job.name.clone(),
            due: Some(due),
            result,
        })
    }

    /// Spawn the tick loop. Returns a handle for shutdown and status.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let state = self.state.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(owner = %self.owner, jobs = self.jobs.len(), "scheduler started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick(Utc::now()).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(owner = %self.owner, "scheduler stopped");
        });
        SchedulerHandle {
            shutdown,
            join: Some(join),
            state,
        }
    }
}

fn needs_retry(result: &Result<Outcome<JobReport>, String>) -> bool {
    match result {
        Err(_) => true,
        Ok(Outcome::Applied(report) | Outcome::AlreadyApplied(report)) => report.incomplete,
        Ok(Outcome::Rejected(rejection)) => rejection.kind == RejectionKind::LockHeld,
    }
}

/// Handle to a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    state: Arc<Mutex<BTreeMap<String, JobState>>>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for an in-flight run to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "scheduler task ended abnormally");
            }
        }
    }

    pub fn status(&self) -> BTreeMap<String, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
