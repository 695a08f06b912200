//! Parsing for human-readable lifetimes like `"30m"`, `"2h30m"` or `"1d"`.

use std::time::Duration;

use crate::error::{OperatorError, OperatorResult};

/// Parse a duration of the form `(<integer><unit>)+` where the unit is one
/// of `d`, `h`, `m`, `s`. Tokens are summed, so `"1h30m"` is 5400 seconds
/// and `"1d1d"` is two days. Floating-point values, signs and whitespace
/// are rejected.
pub fn parse_duration(input: &str) -> OperatorResult<Duration> {
    let invalid = || OperatorError::InvalidDuration {
        value: input.to_string(),
    };

    if input.is_empty() {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    let mut digits = String::new();

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        let unit_secs: u64 = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(invalid()),
        };

        if digits.is_empty() {
            return Err(invalid());
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();

        total = value
            .checked_mul(unit_secs)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }

    // Trailing digits without a unit are malformed.
    if !digits.is_empty() {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("4h").unwrap(), Duration::from_secs(14400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn compound_tokens_are_summed() {
        assert_eq!(parse_duration("2h30m").unwrap(), Duration::from_secs(9000));
        assert_eq!(
            parse_duration("1d2h3m4s").unwrap(),
            Duration::from_secs(86400 + 7200 + 180 + 4)
        );
    }

    #[test]
    fn repeated_units_are_summed() {
        assert_eq!(parse_duration("1d1d").unwrap(), Duration::from_secs(172800));
    }

    #[test]
    fn zero_is_allowed() {
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "h", "30", "1.5h", "-30s", "30 m", "30x", "m30", "1h30"] {
            assert!(parse_duration(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_duration("99999999999999999999s").is_err());
        assert!(parse_duration("999999999999999999d").is_err());
    }
}
