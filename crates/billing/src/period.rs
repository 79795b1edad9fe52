use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use waypost_core::DomainError;

/// A calendar month in UTC, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillingPeriod {
    year: i32,
    month: u32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> Result<Self, DomainError> {
        let invalid = || DomainError::validation(format!("invalid billing period {year:04}-{month:02}"));
        let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        let start = month_start(year, month).ok_or_else(invalid)?;
        let end = month_start(next_year, next_month).ok_or_else(invalid)?;
        Ok(Self {
            year,
            month,
            start,
            end,
        })
    }

    /// The period `at` falls in.
    pub fn containing(at: DateTime<Utc>) -> Result<Self, DomainError> {
        Self::new(at.year(), at.month())
    }

    /// The last fully closed period as of `now`.
    pub fn last_closed(now: DateTime<Utc>) -> Result<Self, DomainError> {
        Self::containing(now)?.previous()
    }

    pub fn previous(&self) -> Result<Self, DomainError> {
        if self.month == 1 {
            Self::new(self.year - 1, 12)
        } else {
            Self::new(self.year, self.month - 1)
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// `YYYY-MM`.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingPeriod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::validation(format!("billing period must be YYYY-MM, got '{s}'"));
        let (y, m) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = y.parse::<i32>().map_err(|_| invalid())?;
        let month = m.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for BillingPeriod {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BillingPeriod> for String {
    fn from(value: BillingPeriod) -> Self {
        value.to_string()
    }
}
