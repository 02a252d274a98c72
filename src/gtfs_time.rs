//! GTFS clock-time and service-date helpers.
//!
//! GTFS stores clock times as "HH:MM:SS" where the hour may exceed 23 for
//! trips running past midnight on their service day (25:10:00 is 01:10 the
//! next morning). Those overflow hours must be preserved, so everything in
//! this crate works in seconds since the service day's local midnight and
//! only converts back to strings at the store boundary.

use chrono::{Datelike, NaiveDate, Weekday};

use crate::error::{Error, Result};

/// Parse a "HH:MM:SS" string into seconds since the service day start.
/// Hours beyond 23 are legal and carried through.
pub fn parse_hms_to_secs(time_str: &str) -> Result<i64> {
    let trimmed = time_str.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_input("empty time string"));
    }

    let mut parts = trimmed.splitn(3, ':');
    let (h, m, s) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(s)) => (h, m, s),
        _ => {
            return Err(Error::invalid_input(format!(
                "invalid time format: {trimmed}"
            )))
        }
    };

    let hours: i64 = h
        .parse()
        .map_err(|_| Error::invalid_input(format!("invalid hours in {trimmed}")))?;
    let minutes: i64 = m
        .parse()
        .map_err(|_| Error::invalid_input(format!("invalid minutes in {trimmed}")))?;
    let seconds: i64 = s
        .parse()
        .map_err(|_| Error::invalid_input(format!("invalid seconds in {trimmed}")))?;

    if !(0..60).contains(&minutes) || !(0..60).contains(&seconds) || hours < 0 {
        return Err(Error::invalid_input(format!("time out of range: {trimmed}")));
    }

    Ok(hours * 3600 + minutes * 60 + seconds)
}

/// Format seconds-since-day-start back to a zero-padded "HH:MM:SS" string.
/// Zero padding keeps lexicographic string comparison correct for hours in
/// [00, 99], which the departure-time SQL filters rely on.
pub fn format_secs_as_hms(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Parse a GTFS "YYYYMMDD" date string.
pub fn parse_service_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date.trim(), "%Y%m%d")
        .map_err(|_| Error::invalid_input(format!("invalid date, expected YYYYMMDD: {date}")))
}

/// Format a date as the GTFS "YYYYMMDD" form used across the store.
pub fn format_service_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Calendar-table column name for a weekday.
pub fn weekday_column(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_times() {
        assert_eq!(parse_hms_to_secs("08:05:00").unwrap(), 29100);
        assert_eq!(parse_hms_to_secs("00:00:00").unwrap(), 0);
        assert_eq!(parse_hms_to_secs("23:59:59").unwrap(), 86399);
    }

    #[test]
    fn carries_service_day_overflow() {
        // 25:10:00 is 01:10 the next morning but stays on the service day.
        assert_eq!(parse_hms_to_secs("25:10:00").unwrap(), 90600);
        assert_eq!(parse_hms_to_secs("47:59:59").unwrap(), 172799);
    }

    #[test]
    fn rejects_malformed_times() {
        assert!(parse_hms_to_secs("").is_err());
        assert!(parse_hms_to_secs("0805").is_err());
        assert!(parse_hms_to_secs("08:65:00").is_err());
        assert!(parse_hms_to_secs("ab:cd:ef").is_err());
    }

    #[test]
    fn formats_zero_padded() {
        assert_eq!(format_secs_as_hms(29100), "08:05:00");
        assert_eq!(format_secs_as_hms(90600), "25:10:00");
        // Zero padding keeps string comparison consistent with numeric order.
        assert!(format_secs_as_hms(32400) > format_secs_as_hms(29100));
    }

    #[test]
    fn service_dates_round_trip() {
        let d = parse_service_date("20240715").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 7, 15).unwrap());
        assert_eq!(format_service_date(d), "20240715");
        assert_eq!(weekday_column(d), "monday");
        assert!(parse_service_date("2024-07-15").is_err());
    }
}
