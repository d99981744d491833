use chrono::Duration;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{BackupError, Result};

lazy_static! {
    static ref DURATION_PART: Regex = Regex::new(r"(\d+)(ms|s|m|h|d|w)").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum artifact age, e.g. `24h`, `7d`, `1d12h`.
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub keep_forever: bool,
}

impl RetentionPolicy {
    pub fn max_age(&self) -> Result<Duration> {
        parse_retention_duration(&self.duration)
    }
}

/// Parses a retention duration made of `<number><unit>` parts, where unit is
/// one of `ms`, `s`, `m`, `h`, `d` or `w`. Parts may be chained (`1d12h`).
pub fn parse_retention_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(BackupError::Configuration(
            "retention duration is empty".to_string(),
        ));
    }

    let mut total = Duration::zero();
    let mut consumed = 0;
    for caps in DURATION_PART.captures_iter(trimmed) {
        let whole = caps.get(0).unwrap();
        if whole.start() != consumed {
            break;
        }
        consumed = whole.end();

        let value: i64 = caps[1].parse().map_err(|_| {
            BackupError::Configuration(format!("retention duration out of range: {}", input))
        })?;
        let part = match &caps[2] {
            "ms" => Duration::try_milliseconds(value),
            "s" => Duration::try_seconds(value),
            "m" => Duration::try_minutes(value),
            "h" => Duration::try_hours(value),
            "d" => Duration::try_days(value),
            "w" => Duration::try_weeks(value),
            _ => None,
        };
        total = part.and_then(|part| total.checked_add(&part)).ok_or_else(|| {
            BackupError::Configuration(format!("retention duration out of range: {}", input))
        })?;
    }

    if consumed != trimmed.len() {
        return Err(BackupError::Configuration(format!(
            "invalid retention duration '{}'; expected e.g. 24h, 7d or 1d12h",
            input
        )));
    }
    if total <= Duration::zero() {
        return Err(BackupError::Configuration(format!(
            "retention duration must be positive: {}",
            input
        )));
    }
    Ok(total)
}
