// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Date-string to epoch-milliseconds conversion.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use tracing::debug;

use crate::errors::ConfigError;

pub const EPOCH: &str = "epoch";
pub const DEFAULT_FORMATS: &str = "%Y-%m-%dT%H:%M:%SZ,%Y-%m-%dT%H:%M:%S,%Y%m%dT%H%M%SZ,epoch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    /// 9-12 digits are seconds, 13-14 digits are milliseconds.
    Epoch,
    /// A `strftime` pattern.
    Pattern(String),
}

impl From<&str> for TimestampFormat {
    fn from(format: &str) -> Self {
        if format.eq_ignore_ascii_case(EPOCH) {
            TimestampFormat::Epoch
        } else {
            TimestampFormat::Pattern(format.to_string())
        }
    }
}

/// The zone naive date strings are read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Fixed(FixedOffset),
    /// An IANA zone, with its daylight saving rules.
    Named(Tz),
}

impl Zone {
    fn local_millis(self, naive: &NaiveDateTime) -> Option<i64> {
        match self {
            Zone::Fixed(offset) => local_millis(&offset, naive),
            Zone::Named(tz) => local_millis(&tz, naive),
        }
    }
}

/// Ambiguous local times take the earlier instant. Times skipped by a forward
/// transition are read one hour later, on the far side of the gap.
fn local_millis<Z: TimeZone>(zone: &Z, naive: &NaiveDateTime) -> Option<i64> {
    match zone.from_local_datetime(naive) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => Some(dt.timestamp_millis()),
        LocalResult::None => {
            let shifted = naive.checked_add_signed(TimeDelta::try_hours(1)?)?;
            zone.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.timestamp_millis())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampParser {
    formats: Vec<TimestampFormat>,
    zone: Zone,
}

impl Default for TimestampParser {
    fn default() -> Self {
        TimestampParser {
            formats: split_formats(DEFAULT_FORMATS),
            zone: Zone::Fixed(utc()),
        }
    }
}

#[allow(clippy::unwrap_used)]
fn utc() -> FixedOffset {
    // zero is always within range
    FixedOffset::east_opt(0).unwrap()
}

fn split_formats(list: &str) -> Vec<TimestampFormat> {
    list.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(TimestampFormat::from)
        .collect()
}

/// Recognises `UTC`, `GMT`, `Z`, fixed `±HH:MM` / `±HHMM` offsets and IANA zone names
/// such as `America/New_York`.
pub fn parse_timezone(timezone: &str) -> Result<Zone, ConfigError> {
    let tz = timezone.trim();
    if tz.is_empty() || ["UTC", "GMT", "Z"].iter().any(|z| tz.eq_ignore_ascii_case(z)) {
        return Ok(Zone::Fixed(utc()));
    }
    let invalid = || ConfigError::invalid("timezone", format!("unrecognised timezone '{timezone}'"));

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Tz::from_str(tz).map(Zone::Named).map_err(|_| invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .map(Zone::Fixed)
        .ok_or_else(invalid)
}

impl TimestampParser {
    #[must_use]
    pub fn new(formats: Vec<TimestampFormat>, zone: Zone) -> Self {
        TimestampParser { formats, zone }
    }

    /// Builds a parser from a comma-separated format list and a timezone name.
    pub fn from_config(formats: &str, timezone: &str) -> Result<Self, ConfigError> {
        let formats = if formats.trim().is_empty() {
            split_formats(DEFAULT_FORMATS)
        } else {
            split_formats(formats)
        };
        Ok(TimestampParser {
            formats,
            zone: parse_timezone(timezone)?,
        })
    }

    /// Tries each configured format in order; the first match wins.
    #[must_use]
    pub fn parse(&self, text: &str) -> Option<i64> {
        let text = text.trim();
        for format in &self.formats {
            let parsed = match format {
                TimestampFormat::Epoch => parse_epoch(text),
                TimestampFormat::Pattern(pattern) => self.parse_pattern(text, pattern),
            };
            if parsed.is_some() {
                return parsed;
            }
            debug!("timestamp {} does not match {:?}", text, format);
        }
        None
    }

    fn parse_pattern(&self, text: &str, pattern: &str) -> Option<i64> {
        if pattern.contains("%z") || pattern.contains("%:z") {
            return DateTime::parse_from_str(text, pattern)
                .ok()
                .map(|dt| dt.timestamp_millis());
        }
        let naive = NaiveDateTime::parse_from_str(text, pattern).ok().or_else(|| {
            NaiveDate::parse_from_str(text, pattern)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
        self.zone.local_millis(&naive)
    }
}

fn parse_epoch(text: &str) -> Option<i64> {
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i64 = text.parse().ok()?;
    match text.len() {
        13..=14 => Some(value),
        9..=12 => value.checked_mul(1000),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_seconds_and_millis() {
        let p = TimestampParser::default();
        assert_eq!(p.parse("1700000000"), Some(1_700_000_000_000));
        assert_eq!(p.parse("1700000000123"), Some(1_700_000_000_123));
        assert_eq!(p.parse("12345"), None);
        assert_eq!(p.parse("1700000000.5"), None);
    }

    #[test]
    fn test_iso_defaults() {
        let p = TimestampParser::default();
        assert_eq!(p.parse("2024-01-01T00:00:00Z"), Some(1_704_067_200_000));
        assert_eq!(p.parse("2024-01-01T00:00:00"), Some(1_704_067_200_000));
        assert_eq!(p.parse("20240101T000000Z"), Some(1_704_067_200_000));
        assert_eq!(p.parse("yesterday"), None);
        assert_eq!(p.parse(""), None);
    }

    #[test]
    fn test_configured_timezone_shifts_local_times() {
        let p = TimestampParser::from_config("%Y-%m-%d %H:%M:%S", "+02:00").unwrap();
        assert_eq!(
            p.parse("2024-01-01 02:00:00"),
            Some(1_704_067_200_000)
        );
    }

    #[test]
    fn test_explicit_offset_in_pattern() {
        let p = TimestampParser::from_config("%Y-%m-%dT%H:%M:%S%z", "UTC").unwrap();
        assert_eq!(
            p.parse("2024-01-01T01:00:00+0100"),
            Some(1_704_067_200_000)
        );
    }

    #[test]
    fn test_date_only_pattern() {
        let p = TimestampParser::from_config("%Y-%m-%d", "UTC").unwrap();
        assert_eq!(p.parse("2024-01-01"), Some(1_704_067_200_000));
    }

    #[test]
    fn test_format_order_is_respected() {
        let p = TimestampParser::from_config("epoch,%Y%m%d%H%M%S", "UTC").unwrap();
        // 14 digits read as epoch milliseconds first
        assert_eq!(p.parse("20240101000000"), Some(20_240_101_000_000));
    }

    fn offset_secs(timezone: &str) -> i32 {
        match parse_timezone(timezone).unwrap() {
            Zone::Fixed(offset) => offset.local_minus_utc(),
            Zone::Named(tz) => panic!("expected a fixed offset, got {tz:?}"),
        }
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(offset_secs("UTC"), 0);
        assert_eq!(offset_secs("gmt"), 0);
        assert_eq!(offset_secs("-08:00"), -8 * 3600);
        assert_eq!(offset_secs("+0530"), 5 * 3600 + 30 * 60);
        assert_eq!(
            parse_timezone("US/Pacific").unwrap(),
            Zone::Named(chrono_tz::US::Pacific)
        );
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(parse_timezone("+5").is_err());
        assert!(parse_timezone("+01:75").is_err());
    }

    #[test]
    fn test_named_zone_follows_daylight_saving() {
        let p = TimestampParser::from_config("%Y-%m-%d %H:%M:%S", "America/New_York").unwrap();
        // EST, UTC-5
        assert_eq!(p.parse("2024-01-01 00:00:00"), Some(1_704_085_200_000));
        // EDT, UTC-4
        assert_eq!(p.parse("2024-07-01 00:00:00"), Some(1_719_806_400_000));
    }

    #[test]
    fn test_named_zone_transitions() {
        let p = TimestampParser::from_config("%Y-%m-%d %H:%M:%S", "America/New_York").unwrap();
        // 01:30 happens twice on the fall-back day; the EDT reading comes first
        assert_eq!(p.parse("2024-11-03 01:30:00"), Some(1_730_611_800_000));
        // 02:30 is skipped on the spring-forward day
        assert_eq!(p.parse("2024-03-10 02:30:00"), Some(1_710_055_800_000));
        assert_eq!(p.parse("2024-03-10 03:30:00"), Some(1_710_055_800_000));
    }
}
