//! Common errors across the snowex-stack crate

use chrono::NaiveDate;

/// Errors related to working with flight and retrieval dates
#[derive(Debug, thiserror::Error)]
pub enum DateError {
    #[error("Year {0}, month {1}, day {2} is not a valid date")]
    InvalidYearMonthDay(i32, u32, u32),
    #[error("Adding {days} days to {date} leaves the representable date range")]
    OutOfRange { date: NaiveDate, days: u64 },
    #[error("Could not parse '{0}' as a YYYY-MM-DD date")]
    Unparseable(String),
    #[error("Unsupported time units '{0}', expected '<days|hours|minutes|seconds> since <date>'")]
    BadTimeUnits(String),
    #[error("Time value {0} is not a finite number")]
    NonFiniteTime(f64),
}

/// Errors related to the configured set of field sites
#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("Site code '{0}' is not one of the configured sites")]
    UnknownSite(String),
    #[error("Site code '{0}' is configured more than once")]
    DuplicateSite(String),
}
