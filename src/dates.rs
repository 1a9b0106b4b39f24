//! Date conventions for pairing a LIDAR flight with a snow depth retrieval.
//!
//! Retrievals accumulate from the start of the water year, which here begins
//! August 1, and run until two weeks after the flight so that a Sentinel-1
//! acquisition after the flight can still be matched.
use std::fmt::Display;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, TimeDelta};

use crate::error::DateError;

/// Format used for dates in file names, job names and attributes.
pub const DATE_FMT: &str = "%Y-%m-%d";

/// Flights in months after this one are not processed.
pub const LAST_SEASON_MONTH: u32 = 4;

/// First month of the water year.
pub const WATER_YEAR_START_MONTH: u32 = 8;

/// Number of days after the flight that the retrieval window extends.
pub const WINDOW_PADDING_DAYS: u64 = 14;

/// Format a date as `YYYY-MM-DD`.
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate, DateError> {
    NaiveDate::parse_from_str(s, DATE_FMT).map_err(|_| DateError::Unparseable(s.to_string()))
}

/// Whether a flight on this date falls within the snow season we retrieve for.
pub fn is_in_season(flight: NaiveDate) -> bool {
    flight.month() <= LAST_SEASON_MONTH
}

/// The date range passed to the snow depth retrieval for one flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RetrievalWindow {
    /// Compute the window for a flight: August 1 of the water year containing
    /// the flight through [`WINDOW_PADDING_DAYS`] days after the flight.
    pub fn for_flight(flight: NaiveDate) -> Result<Self, DateError> {
        let start_year = if flight.month() < WATER_YEAR_START_MONTH {
            flight.year() - 1
        } else {
            flight.year()
        };

        let start = NaiveDate::from_ymd_opt(start_year, WATER_YEAR_START_MONTH, 1)
            .ok_or(DateError::InvalidYearMonthDay(start_year, WATER_YEAR_START_MONTH, 1))?;
        let end = flight
            .checked_add_days(Days::new(WINDOW_PADDING_DAYS))
            .ok_or(DateError::OutOfRange { date: flight, days: WINDOW_PADDING_DAYS })?;
        Ok(Self { start, end })
    }

    pub fn start_str(&self) -> String {
        format_date(self.start)
    }

    pub fn end_str(&self) -> String {
        format_date(self.end)
    }

    /// The window as the `(start, end)` pair of strings the retrieval expects.
    pub fn as_strings(&self) -> (String, String) {
        (self.start_str(), self.end_str())
    }
}

impl Display for RetrievalWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {}", self.start_str(), self.end_str())
    }
}

/// Units written for the time coordinate of output files.
pub const TIME_UNITS: &str = "days since 1970-01-01 00:00:00";

fn unix_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Encode a date as a value in [`TIME_UNITS`].
pub fn date_to_nctime(date: NaiveDate) -> f64 {
    (date - unix_epoch()).num_days() as f64
}

/// Decode a CF-style time value (e.g. `12.0` with units `days since 2020-01-01`) to a date.
/// Any time of day is truncated.
pub fn nctime_to_date(value: f64, units: &str) -> Result<NaiveDate, DateError> {
    if !value.is_finite() {
        return Err(DateError::NonFiniteTime(value));
    }
    let bad_units = || DateError::BadTimeUnits(units.to_string());
    let (unit, reference) = units.split_once(" since ").ok_or_else(bad_units)?;
    let seconds_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "days" | "day" | "d" => 86400.0,
        "hours" | "hour" | "h" => 3600.0,
        "minutes" | "minute" | "min" => 60.0,
        "seconds" | "second" | "s" => 1.0,
        _ => return Err(bad_units()),
    };

    let reference = reference.trim().trim_end_matches('Z');
    let reference = NaiveDateTime::parse_from_str(reference, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(reference, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            reference
                .get(..10)
                .ok_or_else(bad_units)
                .and_then(|d| parse_date(d).map_err(|_| bad_units()))
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })?;

    let millis = (value * seconds_per_unit * 1000.0).round() as i64;
    let offset = TimeDelta::try_milliseconds(millis).ok_or_else(bad_units)?;
    reference
        .checked_add_signed(offset)
        .map(|dt| dt.date())
        .ok_or_else(bad_units)
}

/// Name of the merged output file for one site and flight, e.g. `Banner_2019-02-15.nc`.
pub fn output_file_name(site_name: &str, flight: NaiveDate) -> String {
    format!("{site_name}_{}.nc", format_date(flight))
}

/// Job name used to cache the retrieval for one site and window.
pub fn job_name(site_code: &str, window: &RetrievalWindow) -> String {
    format!("spicy_{site_code}_{}", window.end_str())
}
