//! Statistics bucket ladder
//!
//! Every insert into the pending, fail or done table refreshes the current
//! bucket of each rung. Buckets are aligned the way PostgreSQL's `date_bin`
//! aligns them, against a fixed origin.

use chrono::{DateTime, Duration, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Rows older than this many months are evicted on write
pub const RETENTION_MONTHS: u32 = 6;

/// Granularity of one statistics table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsInterval {
    OneMinute,
    FiveMinutes,
    ThirtyMinutes,
    OneHour,
    OneDay,
    OneWeek,
    ThirtyDays,
    SixtyDays,
    OneHundredEightyDays,
}

impl StatsInterval {
    /// The full ladder, ascending
    pub const ALL: [StatsInterval; 9] = [
        Self::OneMinute,
        Self::FiveMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::OneDay,
        Self::OneWeek,
        Self::ThirtyDays,
        Self::SixtyDays,
        Self::OneHundredEightyDays,
    ];

    /// PostgreSQL interval literal
    pub fn as_pg_interval(&self) -> &'static str {
        match self {
            Self::OneMinute => "1 minute",
            Self::FiveMinutes => "5 minutes",
            Self::ThirtyMinutes => "30 minutes",
            Self::OneHour => "1 hour",
            Self::OneDay => "1 day",
            Self::OneWeek => "1 week",
            Self::ThirtyDays => "30 days",
            Self::SixtyDays => "60 days",
            Self::OneHundredEightyDays => "180 days",
        }
    }

    /// Suffix of the bucket table name
    pub fn table_suffix(&self) -> &'static str {
        match self {
            Self::OneMinute => "1_minute",
            Self::FiveMinutes => "5_minutes",
            Self::ThirtyMinutes => "30_minutes",
            Self::OneHour => "1_hour",
            Self::OneDay => "1_day",
            Self::OneWeek => "1_week",
            Self::ThirtyDays => "30_days",
            Self::SixtyDays => "60_days",
            Self::OneHundredEightyDays => "180_days",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::OneHour => Duration::hours(1),
            Self::OneDay => Duration::days(1),
            Self::OneWeek => Duration::weeks(1),
            Self::ThirtyDays => Duration::days(30),
            Self::SixtyDays => Duration::days(60),
            Self::OneHundredEightyDays => Duration::days(180),
        }
    }

    /// Start of the bucket containing `at`
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let origin = bucket_origin();
        let stride = self.duration().num_seconds();
        let offset = at.signed_duration_since(origin).num_seconds();
        origin + Duration::seconds(offset.div_euclid(stride) * stride)
    }
}

impl std::fmt::Display for StatsInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_pg_interval())
    }
}

impl std::str::FromStr for StatsInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('_', " ");
        Self::ALL
            .into_iter()
            .find(|iv| iv.as_pg_interval() == normalized)
            .ok_or_else(|| format!("unknown stats interval: {}", s))
    }
}

/// Origin shared by every bucket (`TIMESTAMP '2001-01-01'`)
pub fn bucket_origin() -> DateTime<Utc> {
    let midnight = NaiveDate::from_ymd_opt(2001, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    Utc.from_utc_datetime(&midnight)
}

/// Oldest `created_at` a bucket row may keep at `now`
pub fn retention_horizon(now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(RETENTION_MONTHS))
        .unwrap_or(now)
}
