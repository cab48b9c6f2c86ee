//! Calendar periods for boundary-aligned counters.
//!
//! Period ids are rendered in a fixed UTC offset (`YYYYMMDDHH`, `YYYYMMDD`, `YYYYMM`, `YYYY`) so
//! every replica derives the same key for the same instant.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeDelta, TimeZone, Timelike, Utc};

/// Natural period a counter is aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Hour,
    Day,
    Month,
    Year,
}

impl Period {
    /// Identifier of the period containing `at`.
    pub fn id(&self, at: DateTime<FixedOffset>) -> String {
        match self {
            Period::Hour => {
                format!("{:04}{:02}{:02}{:02}", at.year(), at.month(), at.day(), at.hour())
            }
            Period::Day => format!("{:04}{:02}{:02}", at.year(), at.month(), at.day()),
            Period::Month => format!("{:04}{:02}", at.year(), at.month()),
            Period::Year => format!("{:04}", at.year()),
        }
    }

    /// First instant of the next period.
    pub fn next_boundary(&self, at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let date = at.date_naive();
        let next = match self {
            Period::Hour => date
                .and_hms_opt(at.hour(), 0, 0)
                .map(|start| start + TimeDelta::hours(1)),
            Period::Day => date.succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)),
            Period::Month => {
                let (year, month) =
                    if at.month() == 12 { (at.year() + 1, 1) } else { (at.year(), at.month() + 1) };
                NaiveDate::from_ymd_opt(year, month, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            }
            Period::Year => {
                NaiveDate::from_ymd_opt(at.year() + 1, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            }
        };
        next.and_then(|naive| at.offset().from_local_datetime(&naive).single()).unwrap_or(at)
    }

    /// Time left until the next boundary.
    pub fn remaining(&self, at: DateTime<FixedOffset>) -> Duration {
        (self.next_boundary(at) - at).to_std().unwrap_or_default()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Month => "month",
            Period::Year => "year",
        };
        f.write_str(name)
    }
}

/// Convert epoch milliseconds into a local time at `offset`.
pub fn local_time(epoch_millis: u64, offset: FixedOffset) -> DateTime<FixedOffset> {
    let millis = i64::try_from(epoch_millis).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default().with_timezone(&offset)
}
