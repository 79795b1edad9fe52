//! Engine configuration.
//!
//! Every value has a default; `from_env` overrides from `WAYPOST_*`
//! variables and falls back (with a warning) on anything unparsable.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use waypost_ledger::Tolerance;

use crate::billing_bridge::BridgeSettings;
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::scheduler::{MonthlyFinalizeHandler, MonthlySchedule, ScheduledJob};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Allowed debit/credit imbalance per currency when posting.
    pub balance_tolerance: Tolerance,
    /// Amendments whose delta is within this are not posted.
    pub amendment_tolerance: Tolerance,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            balance_tolerance: Tolerance::DEFAULT,
            amendment_tolerance: Tolerance::DEFAULT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingConfig {
    pub provider_name: String,
    pub grace_days: i64,
    pub webhook_stale_secs: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            provider_name: "stripe".to_string(),
            grace_days: 7,
            webhook_stale_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Day of month (1-28) the finalize job fires, UTC.
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub misfire_grace_secs: i64,
    /// Wait before retrying a run that left periods unfinished.
    pub retry_secs: i64,
    /// Period lock lease of one finalize run.
    pub lease_secs: i64,
    pub tick_secs: u64,
    /// Lock owner name; defaults to a per-process id.
    pub owner: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            day: 1,
            hour: 2,
            minute: 0,
            misfire_grace_secs: 6 * 3600,
            retry_secs: 15 * 60,
            lease_secs: 30 * 60,
            tick_secs: 30,
            owner: format!("worker-{}", std::process::id()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub ledger: LedgerConfig,
    pub billing: BillingConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    /// Postgres stores when set, in-memory otherwise.
    pub database_url: Option<String>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let ledger = LedgerConfig {
            balance_tolerance: tolerance(&get, "WAYPOST_BALANCE_TOLERANCE", d.ledger.balance_tolerance),
            amendment_tolerance: tolerance(&get, "WAYPOST_AMENDMENT_TOLERANCE", d.ledger.amendment_tolerance),
        };

        let billing = BillingConfig {
            provider_name: get("WAYPOST_BILLING_PROVIDER").unwrap_or(d.billing.provider_name),
            grace_days: parsed(&get, "WAYPOST_GRACE_DAYS", d.billing.grace_days),
            webhook_stale_secs: parsed(&get, "WAYPOST_WEBHOOK_STALE_SECS", d.billing.webhook_stale_secs),
        };

        let mut scheduler = SchedulerConfig {
            enabled: parsed(&get, "WAYPOST_FINALIZE_ENABLED", d.scheduler.enabled),
            day: parsed(&get, "WAYPOST_FINALIZE_DAY", d.scheduler.day),
            hour: parsed(&get, "WAYPOST_FINALIZE_HOUR", d.scheduler.hour),
            minute: parsed(&get, "WAYPOST_FINALIZE_MINUTE", d.scheduler.minute),
            misfire_grace_secs: parsed(&get, "WAYPOST_MISFIRE_GRACE_SECS", d.scheduler.misfire_grace_secs),
            retry_secs: parsed(&get, "WAYPOST_FINALIZE_RETRY_SECS", d.scheduler.retry_secs),
            lease_secs: parsed(&get, "WAYPOST_FINALIZE_LEASE_SECS", d.scheduler.lease_secs),
            tick_secs: parsed(&get, "WAYPOST_SCHEDULER_TICK_SECS", d.scheduler.tick_secs),
            owner: get("WAYPOST_WORKER_ID").unwrap_or(d.scheduler.owner),
        };
        if MonthlySchedule::new(scheduler.day, scheduler.hour, scheduler.minute).is_err() {
            warn!(
                day = scheduler.day,
                hour = scheduler.hour,
                minute = scheduler.minute,
                "invalid finalize schedule, using default"
            );
            let fallback = SchedulerConfig::default();
            scheduler.day = fallback.day;
            scheduler.hour = fallback.hour;
            scheduler.minute = fallback.minute;
        }

        let mut retry = RetryPolicy {
            max_retries: parsed(&get, "WAYPOST_RETRY_MAX", d.retry.max_retries),
            base_delay: StdDuration::from_millis(parsed(
                &get,
                "WAYPOST_RETRY_BASE_MS",
                d.retry.base_delay.as_millis() as u64,
            )),
            max_delay: StdDuration::from_millis(parsed(
                &get,
                "WAYPOST_RETRY_MAX_MS",
                d.retry.max_delay.as_millis() as u64,
            )),
            ..d.retry
        };
        if let Some(raw) = get("WAYPOST_RETRY_STRATEGY") {
            match BackoffStrategy::parse(&raw) {
                Some(strategy) => retry.strategy = strategy,
                None => warn!(key = "WAYPOST_RETRY_STRATEGY", value = %raw, "invalid value, using default"),
            }
        }

        Self {
            ledger,
            billing,
            scheduler,
            retry,
            database_url: get("DATABASE_URL"),
        }
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            grace: Duration::days(self.billing.grace_days),
            webhook_stale_after: Duration::seconds(self.billing.webhook_stale_secs),
            retry: self.retry.clone(),
        }
    }

    pub fn finalize_lease(&self) -> Duration {
        Duration::seconds(self.scheduler.lease_secs)
    }

    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.scheduler.tick_secs.max(1))
    }

    /// The monthly finalize job as configured.
    pub fn finalize_job(&self) -> ScheduledJob {
        let s = &self.scheduler;
        ScheduledJob {
            name: MonthlyFinalizeHandler::NAME.to_string(),
            schedule: MonthlySchedule::new(s.day, s.hour, s.minute).unwrap_or_default(),
            enabled: s.enabled,
            misfire_grace: Duration::seconds(s.misfire_grace_secs),
            retry_interval: Duration::seconds(s.retry_secs.max(1)),
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid value, using default");
            default
        }),
    }
}

fn tolerance(get: &impl Fn(&str) -> Option<String>, key: &str, default: Tolerance) -> Tolerance {
    let Some(raw) = get(key) else {
        return default;
    };
    let parsed = Decimal::from_str(&raw)
        .map_err(|e| e.to_string())
        .and_then(|v| Tolerance::new(v).map_err(|e| e.to_string()));
    parsed.unwrap_or_else(|e| {
        warn!(key, value = %raw, error = %e, "invalid tolerance, using default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = EngineConfig::from_lookup(|_| None);
        assert_eq!(cfg.ledger, LedgerConfig::default());
        assert_eq!(cfg.billing, BillingConfig::default());
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.bridge_settings().grace, Duration::days(7));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("WAYPOST_AMENDMENT_TOLERANCE", "0.01"),
            ("WAYPOST_FINALIZE_DAY", "3"),
            ("WAYPOST_FINALIZE_ENABLED", "false"),
            ("WAYPOST_FINALIZE_RETRY_SECS", "120"),
            ("WAYPOST_RETRY_STRATEGY", "linear"),
            ("WAYPOST_WORKER_ID", "w-7"),
            ("DATABASE_URL", "postgres://localhost/waypost"),
        ]));
        assert_eq!(cfg.ledger.amendment_tolerance.value(), dec!(0.01));
        assert_eq!(cfg.ledger.balance_tolerance, Tolerance::DEFAULT);
        assert_eq!(cfg.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(cfg.scheduler.owner, "w-7");

        let job = cfg.finalize_job();
        assert!(!job.enabled);
        assert_eq!(job.schedule.day(), 3);
        assert_eq!(job.retry_interval, Duration::minutes(2));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/waypost"));
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("WAYPOST_BALANCE_TOLERANCE", "-1"),
            ("WAYPOST_GRACE_DAYS", "soon"),
            ("WAYPOST_FINALIZE_DAY", "31"),
            ("WAYPOST_RETRY_STRATEGY", "random"),
        ]));
        assert_eq!(cfg.ledger.balance_tolerance, Tolerance::DEFAULT);
        assert_eq!(cfg.billing.grace_days, 7);
        assert_eq!(cfg.scheduler.day, 1);
        assert_eq!(cfg.retry.strategy, BackoffStrategy::Exponential);
    }
}
