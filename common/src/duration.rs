//! Contract duration strings
//!
//! Contracts are proposed with a human duration such as `"7d"`, `"24h"` or
//! `"30m"`. An integer followed by `d` is a day count; everything else goes
//! through `humantime`. Non-positive or unparseable durations are rejected
//! at propose time.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DurationError {
    #[error("duration is empty")]
    Empty,

    #[error("duration '{0}' is not parseable")]
    Invalid(String),

    #[error("duration '{0}' must be positive")]
    NonPositive(String),
}

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }

    let parsed = match trimmed.strip_suffix('d') {
        Some(days) if !days.is_empty() && days.chars().all(|c| c.is_ascii_digit()) => {
            let days: u64 = days
                .parse()
                .map_err(|_| DurationError::Invalid(trimmed.to_string()))?;
            Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY))
        }
        _ => humantime::parse_duration(trimmed)
            .map_err(|_| DurationError::Invalid(trimmed.to_string()))?,
    };

    if parsed.is_zero() {
        return Err(DurationError::NonPositive(trimmed.to_string()));
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_suffix() {
        assert_eq!(
            parse_duration("7d").unwrap(),
            Duration::from_secs(7 * SECONDS_PER_DAY)
        );
        assert_eq!(
            parse_duration("1d").unwrap(),
            Duration::from_secs(SECONDS_PER_DAY)
        );
    }

    #[test]
    fn test_humantime_forms() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1_800));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1ms").unwrap(), Duration::from_millis(1));
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(matches!(parse_duration(""), Err(DurationError::Empty)));
        assert!(matches!(
            parse_duration("soon"),
            Err(DurationError::Invalid(_))
        ));
        assert!(matches!(
            parse_duration("d"),
            Err(DurationError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_non_positive() {
        assert!(matches!(
            parse_duration("0d"),
            Err(DurationError::NonPositive(_))
        ));
        assert!(matches!(
            parse_duration("0s"),
            Err(DurationError::NonPositive(_))
        ));
    }
}
