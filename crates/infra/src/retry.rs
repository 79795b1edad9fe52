//! Bounded retry with backoff for calls to external providers.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    /// base * 2^(retry - 1)
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "linear" => Some(Self::Linear),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay used as +/- jitter, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-indexed). Jitter is derived from
    /// the retry number so schedules are reproducible in tests.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay.as_millis() as f64;
        let cap = self.max_delay.as_millis() as f64;
        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * f64::from(retry),
            BackoffStrategy::Exponential => base * 2_f64.powi(retry.saturating_sub(1).min(30) as i32),
        };
        let delay = raw.min(cap);

        let spread = delay * self.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            let unit = f64::from(retry.wrapping_mul(17) % 100) / 100.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay + offset).max(0.0) as u64)
    }
}

/// Errors that say whether another attempt can succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
/// Returns the last result and the number of attempts made.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> (Result<T, E>, u32)
where
    E: Transient + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_transient() && attempt <= policy.max_retries => {
                let delay = policy.delay_for_retry(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}
