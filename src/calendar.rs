//! Calendar arithmetic for WRF timestamps.
//!
//! WRF writes its timestamps as `YYYY-MM-DD_HH:MM:SS` strings. Model runs may use
//! a calendar without leap days, in which case intervals computed with the real
//! (proleptic Gregorian) calendar are one day too long whenever they span
//! 29 February. The functions here detect and correct that.
use std::fmt::Display;

use chrono::{Datelike, NaiveDate, NaiveDateTime};

/// The `strftime` format of WRF timestamps.
pub const WRF_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

pub const SECONDS_PER_DAY: f64 = 86400.0;

/// Days per month in a calendar without leap days.
const DAYS_PER_MONTH_365: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Times of day accepted as the first record of a month. Some reanalysis-driven
/// runs start at 06 UTC instead of midnight.
const MONTH_START_TIMES: [&str; 2] = ["00:00:00", "06:00:00"];

#[derive(Debug, thiserror::Error)]
pub enum DateError {
    #[error("'{0}' is not a valid timestamp (expected YYYY-MM-DD_HH:MM:SS)")]
    InvalidTimestamp(String),
    #[error("'{0}' is not a valid YYYY-MM-DD date")]
    InvalidDate(String),
    #[error("Cannot compute a time interval from fewer than two timestamps")]
    TooFewTimestamps,
    #[error("Timestamps from {first} to {last} are not consistent with {expected}")]
    OutsidePeriod {
        first: String,
        last: String,
        expected: String,
    },
    #[error("The last record of {month} falls on day {day}, but the month should end on day {expected}")]
    MonthEnd {
        month: MonthStamp,
        day: u32,
        expected: String,
    },
}

/// Parse a WRF timestamp into a naive datetime.
pub fn parse_timestamp(timestamp: &str) -> Result<NaiveDateTime, DateError> {
    NaiveDateTime::parse_from_str(timestamp.trim(), WRF_TIMESTAMP_FORMAT)
        .map_err(|_| DateError::InvalidTimestamp(timestamp.to_string()))
}

/// Parse the leading `YYYY-MM-DD` part of a timestamp or date string.
pub fn parse_date(date: &str) -> Result<NaiveDate, DateError> {
    let head = date.get(..10).ok_or_else(|| DateError::InvalidDate(date.to_string()))?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").map_err(|_| DateError::InvalidDate(date.to_string()))
}

pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Number of days in `month` (1-based) for a calendar without leap days.
pub fn days_in_month_365(month: u32) -> u32 {
    DAYS_PER_MONTH_365[(month as usize + 11) % 12]
}

/// A calendar month, ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthStamp {
    pub year: i32,
    pub month: u32,
}

impl MonthStamp {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// The month a timestamp (or any string starting with `YYYY-MM-DD`) falls in.
    pub fn from_timestamp(timestamp: &str) -> Result<Self, DateError> {
        let date = parse_date(timestamp)?;
        Ok(Self::from_date(date))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Shift by `n` months (negative values go backwards).
    pub fn offset(self, n: i32) -> Self {
        let zero_based = self.year * 12 + self.month as i32 - 1 + n;
        Self {
            year: zero_based.div_euclid(12),
            month: zero_based.rem_euclid(12) as u32 + 1,
        }
    }

    pub fn next(self) -> Self {
        self.offset(1)
    }

    /// Number of months from `earlier` to `self`; negative if `earlier` is later.
    pub fn months_since(self, earlier: MonthStamp) -> i32 {
        (self.year - earlier.year) * 12 + self.month as i32 - earlier.month as i32
    }

    /// The `YYYY-MM` prefix shared by every timestamp in this month.
    pub fn prefix(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Whether `timestamp` is an acceptable first record for this month.
    pub fn is_month_start(&self, timestamp: &str) -> bool {
        let prefix = format!("{}-01_", self.prefix());
        match timestamp.trim().strip_prefix(&prefix) {
            Some(time) => MONTH_START_TIMES.contains(&time),
            None => false,
        }
    }

    /// Whether `timestamp` falls in a later month than this one. Only the `YYYY-MM`
    /// prefix is compared, the same way the records are scanned.
    pub fn is_before(&self, timestamp: &str) -> bool {
        match timestamp.get(..7) {
            Some(prefix) => self.prefix().as_str() < prefix,
            None => false,
        }
    }

    pub fn is_leap_february(&self) -> bool {
        self.month == 2 && is_leap_year(self.year)
    }
}

impl Display for MonthStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Compute the interval in seconds between the first and last of `timestamps`,
/// removing the leap day if the records skip 29 February.
///
/// The first timestamp must fall in `year`/`month` (if given), the last one may
/// fall in the following month. When the interval spans 29 February of a leap
/// year, the records around the expected position of the leap day are searched;
/// if no record on the 29th is found, the model calendar has no leap days and
/// 86400 s are subtracted.
///
/// # Errors
/// - if fewer than two timestamps are given or any of them cannot be parsed, or
/// - if the timestamps do not match the requested year and month.
pub fn calc_time_delta<S: AsRef<str>>(
    timestamps: &[S],
    year: Option<i32>,
    month: Option<u32>,
) -> Result<f64, DateError> {
    if timestamps.len() < 2 {
        return Err(DateError::TooFewTimestamps);
    }
    let first = timestamps[0].as_ref();
    let last = timestamps[timestamps.len() - 1].as_ref();
    let dt1 = parse_timestamp(first)?;
    let dt2 = parse_timestamp(last)?;

    let year = year.unwrap_or(dt1.year());
    let month = month.unwrap_or(dt1.month());
    let expected = MonthStamp { year, month };
    let start_ok = dt1.year() == year && dt1.month() == month;
    let end_month = MonthStamp::from_date(dt2.date());
    if !start_ok || (end_month != expected && end_month != expected.next()) {
        return Err(DateError::OutsidePeriod {
            first: first.to_string(),
            last: last.to_string(),
            expected: expected.to_string(),
        });
    }

    let delta = (dt2 - dt1).num_seconds() as f64;
    if !expected.is_leap_february() || dt1.day() == 29 || dt2.day() == 29 {
        return Ok(delta);
    }

    let leap_day = NaiveDate::from_ymd_opt(year, 2, 29)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| DateError::InvalidDate(format!("{year}-02-29")))?;
    if !(dt1 < leap_day && leap_day < dt2) {
        return Ok(delta);
    }

    // Estimate where the leap day would be assuming even sampling, then walk
    // forward until we either find it or reach March.
    let n = timestamps.len();
    let before_leap = (leap_day - dt1).num_seconds() as f64;
    let mut ild = ((n - 1) as f64 * before_leap / delta) as usize;
    let mut subtract = true;
    while subtract && ild < n {
        let date = parse_date(timestamps[ild].as_ref())?;
        if date.month() == 3 {
            break;
        }
        if date.year() != year || date.month() != 2 {
            return Err(DateError::OutsidePeriod {
                first: first.to_string(),
                last: last.to_string(),
                expected: expected.to_string(),
            });
        }
        if date.day() == 29 {
            subtract = false;
        }
        ild += 1;
    }

    if subtract {
        Ok(delta - SECONDS_PER_DAY)
    } else {
        Ok(delta)
    }
}

/// Elapsed seconds of a complete month, from its first record (`start`) to the
/// first record of the following month (`end`). `last_in_month` is the final
/// record that belongs to `month` and is used to detect calendars without leap
/// days: if a leap-year February ends on the 28th, one day is removed.
///
/// Returns the elapsed time and whether the leap-day correction was applied.
pub fn month_elapsed_seconds(
    start: &str,
    end: &str,
    last_in_month: &str,
    month: MonthStamp,
) -> Result<(f64, bool), DateError> {
    let dt1 = parse_timestamp(start)?;
    let dt2 = parse_timestamp(end)?;
    let elapsed = (dt2 - dt1).num_seconds() as f64;

    let last = parse_date(last_in_month)?;
    if MonthStamp::from_date(last) != month {
        return Err(DateError::OutsidePeriod {
            first: start.to_string(),
            last: last_in_month.to_string(),
            expected: month.to_string(),
        });
    }

    if month.is_leap_february() {
        match last.day() {
            28 => Ok((elapsed - SECONDS_PER_DAY, true)),
            29 => Ok((elapsed, false)),
            day => Err(DateError::MonthEnd {
                month,
                day,
                expected: "28 or 29".to_string(),
            }),
        }
    } else if last.day() == days_in_month_365(month.month) {
        Ok((elapsed, false))
    } else {
        Err(DateError::MonthEnd {
            month,
            day: last.day(),
            expected: days_in_month_365(month.month).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamps(start: &str, n: usize, step_hours: i64, skip_leap_day: bool) -> Vec<String> {
        let mut t = parse_timestamp(start).unwrap();
        let mut out = vec![];
        while out.len() < n {
            if skip_leap_day && t.month() == 2 && t.day() == 29 {
                t += chrono::Duration::days(1);
                continue;
            }
            out.push(t.format(WRF_TIMESTAMP_FORMAT).to_string());
            t += chrono::Duration::hours(step_hours);
        }
        out
    }

    #[test]
    fn test_month_arithmetic() {
        let m = MonthStamp::new(1979, 11).unwrap();
        assert_eq!(m.offset(2), MonthStamp::new(1980, 1).unwrap());
        assert_eq!(m.offset(-11), MonthStamp::new(1978, 12).unwrap());
        assert_eq!(MonthStamp::new(1981, 2).unwrap().months_since(m), 15);
        assert_eq!(m.to_string(), "1979-11");
        assert!(MonthStamp::new(1979, 13).is_none());
    }

    #[test]
    fn test_month_start() {
        let m = MonthStamp::new(1979, 1).unwrap();
        assert!(m.is_month_start("1979-01-01_00:00:00"));
        assert!(m.is_month_start("1979-01-01_06:00:00"));
        assert!(!m.is_month_start("1979-01-01_12:00:00"));
        assert!(!m.is_month_start("1979-01-02_00:00:00"));
        assert!(!m.is_month_start("1979-02-01_00:00:00"));
        assert!(m.is_before("1979-02-01_00:00:00"));
        assert!(!m.is_before("1979-01-31_18:00:00"));
    }

    #[test]
    fn test_delta_without_leap_day() {
        let ts = stamps("1979-01-01_00:00:00", 5, 6, false);
        assert_eq!(calc_time_delta(&ts, None, None).unwrap(), 4.0 * 6.0 * 3600.0);
    }

    #[test]
    fn test_delta_subtracts_missing_leap_day() {
        // Feb 1980 with a no-leap calendar: 28 days of 6-hourly records, then 1 Mar
        let ts = stamps("1980-02-01_00:00:00", 28 * 4 + 1, 6, true);
        assert_eq!(ts.last().unwrap(), "1980-03-01_00:00:00");
        let naive = 29.0 * SECONDS_PER_DAY;
        let delta = calc_time_delta(&ts, Some(1980), Some(2)).unwrap();
        assert_eq!(delta, naive - SECONDS_PER_DAY);
    }

    #[test]
    fn test_delta_keeps_real_leap_day() {
        let ts = stamps("1980-02-01_00:00:00", 29 * 4 + 1, 6, false);
        assert_eq!(ts.last().unwrap(), "1980-03-01_00:00:00");
        let delta = calc_time_delta(&ts, Some(1980), Some(2)).unwrap();
        assert_eq!(delta, 29.0 * SECONDS_PER_DAY);
    }

    #[test]
    fn test_delta_wrong_month() {
        let ts = stamps("1980-02-01_00:00:00", 3, 24, false);
        assert!(calc_time_delta(&ts, Some(1980), Some(3)).is_err());
        assert!(calc_time_delta(&ts[..1], None, None).is_err());
    }

    #[test]
    fn test_month_elapsed() {
        let feb = MonthStamp::new(1980, 2).unwrap();
        let (secs, corrected) = month_elapsed_seconds(
            "1980-02-01_00:00:00",
            "1980-03-01_00:00:00",
            "1980-02-28_18:00:00",
            feb,
        )
        .unwrap();
        assert!(corrected);
        assert_eq!(secs, 28.0 * SECONDS_PER_DAY);

        let (secs, corrected) = month_elapsed_seconds(
            "1980-02-01_00:00:00",
            "1980-03-01_00:00:00",
            "1980-02-29_18:00:00",
            feb,
        )
        .unwrap();
        assert!(!corrected);
        assert_eq!(secs, 29.0 * SECONDS_PER_DAY);

        let apr = MonthStamp::new(1979, 4).unwrap();
        let res = month_elapsed_seconds(
            "1979-04-01_00:00:00",
            "1979-05-01_00:00:00",
            "1979-04-29_18:00:00",
            apr,
        );
        assert!(res.is_err());
    }
}
