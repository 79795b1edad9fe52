use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use waypost_core::DomainError;

/// Fires once per calendar month at `day hh:mm` UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlySchedule {
    day: u32,
    hour: u32,
    minute: u32,
}

impl MonthlySchedule {
    /// `day` is capped at 28 so every month has the fire date.
    pub fn new(day: u32, hour: u32, minute: u32) -> Result<Self, DomainError> {
        if !(1..=28).contains(&day) || hour > 23 || minute > 59 {
            return Err(DomainError::validation(format!(
                "invalid monthly schedule: day {day} (1-28), {hour:02}:{minute:02}"
            )));
        }
        Ok(Self { day, hour, minute })
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    fn fire_time(&self, year: i32, month: u32) -> Option<DateTime<Utc>> {
        NaiveDate::from_ymd_opt(year, month, self.day)
            .and_then(|d| d.and_hms_opt(self.hour, self.minute, 0))
            .map(|n| n.and_utc())
    }

    /// Most recent fire time at or before `now`.
    pub fn latest_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let this_month = self.fire_time(now.year(), now.month())?;
        if this_month <= now {
            return Some(this_month);
        }
        let (year, month) = if now.month() == 1 {
            (now.year() - 1, 12)
        } else {
            (now.year(), now.month() - 1)
        };
        self.fire_time(year, month)
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let this_month = self.fire_time(now.year(), now.month())?;
        if this_month > now {
            return Some(this_month);
        }
        let (year, month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        self.fire_time(year, month)
    }
}

impl Default for MonthlySchedule {
    /// 1st of the month, 02:00 UTC.
    fn default() -> Self {
        Self {
            day: 1,
            hour: 2,
            minute: 0,
        }
    }
}
