//! Calendar-aware interval buckets
//!
//! Every bucket is identified by its UTC start instant; the bucket covers
//! `[start, end)`. Fixed-width intervals floor to a multiple of their width
//! since the epoch, calendar intervals snap to day/week/month boundaries.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntervalType {
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "monthly")]
    Monthly,
    #[serde(rename = "semiannual")]
    Semiannual,
    #[serde(rename = "yearly")]
    Yearly,
}

impl IntervalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Min15 => "15m",
            IntervalType::Min30 => "30m",
            IntervalType::Hourly => "hourly",
            IntervalType::Daily => "daily",
            IntervalType::Weekly => "weekly",
            IntervalType::Monthly => "monthly",
            IntervalType::Semiannual => "semiannual",
            IntervalType::Yearly => "yearly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "15m" => Some(IntervalType::Min15),
            "30m" => Some(IntervalType::Min30),
            "hourly" | "1h" => Some(IntervalType::Hourly),
            "daily" => Some(IntervalType::Daily),
            "weekly" => Some(IntervalType::Weekly),
            "monthly" => Some(IntervalType::Monthly),
            "semiannual" | "sixmonths" => Some(IntervalType::Semiannual),
            "yearly" => Some(IntervalType::Yearly),
            _ => None,
        }
    }

    pub fn all() -> [IntervalType; 8] {
        [
            IntervalType::Min15,
            IntervalType::Min30,
            IntervalType::Hourly,
            IntervalType::Daily,
            IntervalType::Weekly,
            IntervalType::Monthly,
            IntervalType::Semiannual,
            IntervalType::Yearly,
        ]
    }

    /// Width of fixed intervals; calendar intervals vary in length
    pub fn fixed_duration(&self) -> Option<Duration> {
        match self {
            IntervalType::Min15 => Some(Duration::minutes(15)),
            IntervalType::Min30 => Some(Duration::minutes(30)),
            IntervalType::Hourly => Some(Duration::hours(1)),
            IntervalType::Daily => Some(Duration::days(1)),
            IntervalType::Weekly => Some(Duration::weeks(1)),
            IntervalType::Monthly | IntervalType::Semiannual | IntervalType::Yearly => None,
        }
    }

    /// Finer interval whose stored records roll up into this one
    ///
    /// `None` means the interval is computed straight from raw readings.
    pub fn rollup_source(&self) -> Option<IntervalType> {
        match self {
            IntervalType::Min15 | IntervalType::Min30 | IntervalType::Hourly => None,
            IntervalType::Daily => Some(IntervalType::Hourly),
            IntervalType::Weekly | IntervalType::Monthly => Some(IntervalType::Daily),
            IntervalType::Semiannual | IntervalType::Yearly => Some(IntervalType::Monthly),
        }
    }

    /// Number of rollup hops between this interval and raw readings
    pub fn rollup_depth(&self) -> u32 {
        match self.rollup_source() {
            None => 0,
            Some(source) => 1 + source.rollup_depth(),
        }
    }

    /// UTC start of the bucket containing `ts`
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        match self {
            IntervalType::Min15 | IntervalType::Min30 | IntervalType::Hourly => {
                let width = self.fixed_duration().map(|d| d.num_seconds()).unwrap_or(3600);
                let offset = ts.timestamp().rem_euclid(width);
                ts - Duration::seconds(offset) - Duration::nanoseconds(ts.timestamp_subsec_nanos() as i64)
            }
            IntervalType::Daily => midnight(date),
            IntervalType::Weekly => {
                midnight(date - Duration::days(date.weekday().num_days_from_monday() as i64))
            }
            IntervalType::Monthly => midnight(first_of_month(date)),
            IntervalType::Semiannual => {
                let jan1 = first_of_year(date);
                if date.month() <= 6 {
                    midnight(jan1)
                } else {
                    let first_half_days = if is_leap_year(date.year()) { 182 } else { 181 };
                    midnight(jan1 + Duration::days(first_half_days))
                }
            }
            IntervalType::Yearly => midnight(first_of_year(date)),
        }
    }

    /// Exclusive end of the bucket starting at `start`
    pub fn bucket_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self.fixed_duration() {
            Some(width) => start + width,
            None => {
                // Jump past the end of the longest possible bucket, then snap back
                let overshoot = match self {
                    IntervalType::Monthly => Duration::days(32),
                    IntervalType::Semiannual => Duration::days(200),
                    _ => Duration::days(400),
                };
                self.bucket_start(start + overshoot)
            }
        }
    }

    /// Start of the most recent bucket that closed at or before `now`
    pub fn last_closed_bucket(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_start(self.bucket_start(now) - Duration::milliseconds(1))
    }

    /// Start of the next bucket after the one containing `ts`
    pub fn next_boundary(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_end(self.bucket_start(ts))
    }
}

impl std::fmt::Display for IntervalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&NaiveDateTime::new(date, NaiveTime::default()))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

fn first_of_year(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.ordinal0() as i64)
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
