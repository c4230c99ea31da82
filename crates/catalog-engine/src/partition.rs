//! Partition-key validation and time-window bucket math (`spec.md` §4.4, §4.8).
//!
//! Validation runs in two places: at run-create time (gating a
//! partitioned workflow's run against a required key) and at
//! asset-materialization time (gating an unpartitioned write against a
//! declared partitioning scheme). Both paths call [`validate_partition_key`].

use std::collections::HashMap;

use catalog_core::{EngineError, ErrorKind, Granularity, Partitioning};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc, Weekday};
use regex::Regex;

/// Validates `partition_key` against an asset's declared partitioning
/// scheme (or its absence). Returns the key to persist (`None` for
/// unpartitioned assets).
pub fn validate_partition_key(
    partitioning: Option<&Partitioning>,
    partition_key: Option<&str>,
) -> Result<Option<String>, EngineError> {
    match partitioning {
        None => {
            if partition_key.is_some() {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    "asset is not partitioned; partitionKey must not be supplied",
                ));
            }
            Ok(None)
        }
        Some(scheme) => {
            let key = partition_key
                .ok_or_else(|| EngineError::new(ErrorKind::Validation, "partitionKey is required"))?;
            validate_against_scheme(scheme, key)?;
            Ok(Some(key.to_string()))
        }
    }
}

fn validate_against_scheme(scheme: &Partitioning, key: &str) -> Result<(), EngineError> {
    match scheme {
        Partitioning::Static { keys } => validate_static(keys, key),
        Partitioning::TimeWindow {
            granularity, format, ..
        } => validate_time_window(*granularity, format.as_deref(), key).map(|_| ()),
        Partitioning::Dynamic { .. } => validate_dynamic(key),
    }
}

fn validate_static(keys: &[String], key: &str) -> Result<(), EngineError> {
    if keys.iter().any(|k| k == key) {
        Ok(())
    } else {
        Err(EngineError::new(
            ErrorKind::Validation,
            format!("partitionKey '{key}' is not one of the declared static keys"),
        )
        .with_detail(serde_json::json!({"allowed": keys})))
    }
}

fn validate_dynamic(key: &str) -> Result<(), EngineError> {
    if key.trim().is_empty() {
        return Err(EngineError::new(ErrorKind::Validation, "partitionKey must not be empty"));
    }
    if key.len() > 256 {
        return Err(EngineError::new(
            ErrorKind::Validation,
            "partitionKey exceeds the maximum length of 256 characters",
        ));
    }
    Ok(())
}

/// Validates a time-window partition key against `granularity`/`format`,
/// returning the bucket-start instant the key denotes on success. Format
/// mismatches (including a value that is the right length but the wrong
/// shape, e.g. an hour suffix on a day-granularity key) and out-of-range
/// calendar components (month 13, Feb 30) are both rejected.
pub fn validate_time_window(
    granularity: Granularity,
    format: Option<&str>,
    key: &str,
) -> Result<DateTime<Utc>, EngineError> {
    let template = format.unwrap_or_else(|| default_format(granularity));
    let tokens = tokenize(template);
    let (regex, fields) = build_regex(&tokens);

    let captures = regex.captures(key).ok_or_else(|| {
        EngineError::new(
            ErrorKind::Validation,
            format!("partitionKey '{key}' does not match the expected format '{template}'"),
        )
    })?;

    let mut values: HashMap<FieldKind, u32> = HashMap::new();
    for (idx, field) in fields.iter().enumerate() {
        let raw = &captures[idx + 1];
        let parsed: u32 = raw.parse().map_err(|_| {
            EngineError::new(
                ErrorKind::Validation,
                format!("partitionKey '{key}' has a non-numeric field"),
            )
        })?;
        values.insert(*field, parsed);
    }

    bucket_start_from_fields(granularity, &values, key)
}

fn bucket_start_from_fields(
    granularity: Granularity,
    values: &HashMap<FieldKind, u32>,
    key: &str,
) -> Result<DateTime<Utc>, EngineError> {
    let invalid = || {
        EngineError::new(
            ErrorKind::Validation,
            format!("partitionKey '{key}' is not a valid calendar value"),
        )
    };

    match granularity {
        Granularity::Hour => {
            let (year, month, day, hour) = (
                year_of(values)?,
                *values.get(&FieldKind::Month).ok_or_else(invalid)?,
                *values.get(&FieldKind::Day).ok_or_else(invalid)?,
                *values.get(&FieldKind::Hour).ok_or_else(invalid)?,
            );
            let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
            let naive = date
                .and_hms_opt(hour, 0, 0)
                .ok_or_else(invalid)?;
            Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
        }
        Granularity::Day => {
            let (year, month, day) = (
                year_of(values)?,
                *values.get(&FieldKind::Month).ok_or_else(invalid)?,
                *values.get(&FieldKind::Day).ok_or_else(invalid)?,
            );
            let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
            Ok(DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap(), Utc))
        }
        Granularity::Week => {
            let year = year_of(values)?;
            let week = *values.get(&FieldKind::Week).ok_or_else(invalid)?;
            let date = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).ok_or_else(invalid)?;
            Ok(DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap(), Utc))
        }
        Granularity::Month => {
            let year = year_of(values)?;
            let month = *values.get(&FieldKind::Month).ok_or_else(invalid)?;
            let date = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
            Ok(DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap(), Utc))
        }
    }
}

fn year_of(values: &HashMap<FieldKind, u32>) -> Result<i32, EngineError> {
    values
        .get(&FieldKind::Year)
        .or_else(|| values.get(&FieldKind::WeekYear))
        .map(|y| *y as i32)
        .ok_or_else(|| EngineError::new(ErrorKind::Validation, "partitionKey is missing a year field"))
}

/// Formats `instant` (already the bucket start) back into the key string
/// for a given granularity/format, the inverse of [`validate_time_window`].
pub fn format_bucket(instant: DateTime<Utc>, granularity: Granularity, format: Option<&str>) -> String {
    let template = format.unwrap_or_else(|| default_format(granularity));
    let tokens = tokenize(template);
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Year => out.push_str(&format!("{:04}", instant.year())),
            Token::WeekYear => out.push_str(&format!("{:04}", instant.iso_week().year())),
            Token::Month => out.push_str(&format!("{:02}", instant.month())),
            Token::Day => out.push_str(&format!("{:02}", instant.day())),
            Token::Hour => out.push_str(&format!("{:02}", instant.hour())),
            Token::Week => out.push_str(&format!("{:02}", instant.iso_week().week())),
            Token::Literal(c) => out.push(c),
        }
    }
    out
}

/// Rounds `now` down to the start of its current bucket for `granularity`.
pub fn bucket_start(now: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    match granularity {
        Granularity::Hour => now
            .date_naive()
            .and_hms_opt(now.hour(), 0, 0)
            .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
            .unwrap_or(now),
        Granularity::Day => DateTime::from_naive_utc_and_offset(now.date_naive().and_hms_opt(0, 0, 0).unwrap(), Utc),
        Granularity::Week => {
            let monday = now.date_naive() - Duration::days(now.weekday().num_days_from_monday() as i64);
            DateTime::from_naive_utc_and_offset(monday.and_hms_opt(0, 0, 0).unwrap(), Utc)
        }
        Granularity::Month => {
            let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1).unwrap();
            DateTime::from_naive_utc_and_offset(first.and_hms_opt(0, 0, 0).unwrap(), Utc)
        }
    }
}

fn step_back(instant: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    match granularity {
        Granularity::Hour => instant - Duration::hours(1),
        Granularity::Day => instant - Duration::days(1),
        Granularity::Week => instant - Duration::weeks(1),
        Granularity::Month => {
            let (year, month) = if instant.month() == 1 {
                (instant.year() - 1, 12)
            } else {
                (instant.year(), instant.month() - 1)
            };
            let date = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
            DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap(), Utc)
        }
    }
}

/// Enumerates the `lookback_windows` most recent bucket keys for a
/// time-window asset, most recent first, including the current bucket.
pub fn enumerate_lookback_keys(
    now: DateTime<Utc>,
    granularity: Granularity,
    format: Option<&str>,
    lookback_windows: u32,
) -> Vec<String> {
    let mut keys = Vec::with_capacity(lookback_windows as usize);
    let mut cursor = bucket_start(now, granularity);
    for _ in 0..lookback_windows.max(1) {
        keys.push(format_bucket(cursor, granularity, format));
        cursor = step_back(cursor, granularity);
    }
    keys
}

fn default_format(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Hour => "YYYY-MM-DDTHH",
        Granularity::Day => "YYYY-MM-DD",
        Granularity::Week => "GGGG-[W]WW",
        Granularity::Month => "YYYY-MM",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FieldKind {
    Year,
    WeekYear,
    Month,
    Day,
    Hour,
    Week,
}

#[derive(Debug, Clone, Copy)]
enum Token {
    Year,
    WeekYear,
    Month,
    Day,
    Hour,
    Week,
    Literal(char),
}

/// Parses a moment.js-style template (`YYYY-MM-DD`, `[W]WW`-style literal
/// brackets) into tokens. Not a general-purpose date format library — just
/// enough to cover the handful of tokens `spec.md`'s asset partitioning
/// format strings use.
fn tokenize(template: &str) -> Vec<Token> {
    let chars: Vec<char> = template.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '[' {
            i += 1;
            while i < chars.len() && chars[i] != ']' {
                tokens.push(Token::Literal(chars[i]));
                i += 1;
            }
            i += 1;
            continue;
        }
        let rest: String = chars[i..].iter().collect();
        if rest.starts_with("YYYY") {
            tokens.push(Token::Year);
            i += 4;
        } else if rest.starts_with("GGGG") {
            tokens.push(Token::WeekYear);
            i += 4;
        } else if rest.starts_with("MM") {
            tokens.push(Token::Month);
            i += 2;
        } else if rest.starts_with("DD") {
            tokens.push(Token::Day);
            i += 2;
        } else if rest.starts_with("HH") {
            tokens.push(Token::Hour);
            i += 2;
        } else if rest.starts_with("WW") {
            tokens.push(Token::Week);
            i += 2;
        } else {
            tokens.push(Token::Literal(chars[i]));
            i += 1;
        }
    }
    tokens
}

fn build_regex(tokens: &[Token]) -> (Regex, Vec<FieldKind>) {
    let mut pattern = String::from("^");
    let mut fields = Vec::new();
    for token in tokens {
        match token {
            Token::Year => {
                pattern.push_str(r"(\d{4})");
                fields.push(FieldKind::Year);
            }
            Token::WeekYear => {
                pattern.push_str(r"(\d{4})");
                fields.push(FieldKind::WeekYear);
            }
            Token::Month => {
                pattern.push_str(r"(\d{2})");
                fields.push(FieldKind::Month);
            }
            Token::Day => {
                pattern.push_str(r"(\d{2})");
                fields.push(FieldKind::Day);
            }
            Token::Hour => {
                pattern.push_str(r"(\d{2})");
                fields.push(FieldKind::Hour);
            }
            Token::Week => {
                pattern.push_str(r"(\d{2})");
                fields.push(FieldKind::Week);
            }
            Token::Literal(c) => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    (Regex::new(&pattern).expect("generated pattern is always valid"), fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_format_accepts_calendar_date() {
        let result = validate_time_window(Granularity::Day, Some("YYYY-MM-DD"), "2025-01-05");
        assert!(result.is_ok());
    }

    #[test]
    fn day_format_rejects_hour_suffix() {
        let result = validate_time_window(Granularity::Day, Some("YYYY-MM-DD"), "2025-01-05T00");
        assert!(result.is_err());
    }

    #[test]
    fn day_format_rejects_invalid_calendar_date() {
        let result = validate_time_window(Granularity::Day, Some("YYYY-MM-DD"), "2025-02-30");
        assert!(result.is_err());
    }

    #[test]
    fn static_partition_requires_declared_key() {
        let scheme = Partitioning::Static {
            keys: vec!["us".to_string(), "eu".to_string()],
        };
        assert!(validate_partition_key(Some(&scheme), Some("us")).is_ok());
        assert!(validate_partition_key(Some(&scheme), Some("apac")).is_err());
    }

    #[test]
    fn partitioned_asset_requires_a_key() {
        let scheme = Partitioning::TimeWindow {
            granularity: Granularity::Day,
            timezone: None,
            format: Some("YYYY-MM-DD".to_string()),
            lookback_windows: None,
        };
        assert!(validate_partition_key(Some(&scheme), None).is_err());
        assert!(validate_partition_key(Some(&scheme), Some("2025-01-05")).is_ok());
    }

    #[test]
    fn unpartitioned_asset_rejects_a_supplied_key() {
        assert!(validate_partition_key(None, Some("anything")).is_err());
        assert!(validate_partition_key(None, None).unwrap().is_none());
    }

    #[test]
    fn lookback_keys_are_most_recent_first() {
        let now = DateTime::parse_from_rfc3339("2025-01-05T10:30:00Z").unwrap().with_timezone(&Utc);
        let keys = enumerate_lookback_keys(now, Granularity::Day, Some("YYYY-MM-DD"), 3);
        assert_eq!(keys, vec!["2025-01-05", "2025-01-04", "2025-01-03"]);
    }
}
