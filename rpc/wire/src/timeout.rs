//! The `grpc-timeout` header codec.
//!
//! Wire form is `<value><unit>` where value is at most 8 digits and unit is
//! one of `H` (hours), `M` (minutes), `S` (seconds), `m` (milliseconds),
//! `u` (microseconds), `n` (nanoseconds).

use std::time::Duration;

/// Maximum digits allowed in the timeout value.
pub const MAX_TIMEOUT_DIGITS: usize = 8;

/// Largest representable millisecond count (63-bit clamp).
const MAX_TIMEOUT_MILLIS: u128 = i64::MAX as u128;

/// Error parsing a `grpc-timeout` value; callers map this to OUT_OF_RANGE.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid grpc-timeout value: {0:?}")]
pub struct TimeoutError(pub String);

/// Parse a `grpc-timeout` header value into a duration.
///
/// Sub-millisecond units truncate toward zero; the result is clamped to a
/// 63-bit millisecond range.
pub fn parse_timeout(wire: &str) -> Result<Duration, TimeoutError> {
    let err = || TimeoutError(wire.to_owned());

    let unit_pos = wire
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .ok_or_else(err)?;
    let (digits, rest) = wire.split_at(unit_pos);
    if digits.is_empty() || digits.len() > MAX_TIMEOUT_DIGITS {
        return Err(err());
    }
    let value: u64 = digits.parse().map_err(|_| err())?;

    let unit = rest.trim_start();
    if unit.len() != 1 {
        return Err(err());
    }

    let nanos: u128 = match unit.as_bytes()[0] {
        b'H' => value as u128 * 3_600_000_000_000,
        b'M' => value as u128 * 60_000_000_000,
        b'S' => value as u128 * 1_000_000_000,
        b'm' => value as u128 * 1_000_000,
        b'u' => value as u128 * 1_000,
        b'n' => value as u128,
        _ => return Err(err()),
    };

    let millis = (nanos / 1_000_000).min(MAX_TIMEOUT_MILLIS);
    Ok(Duration::from_millis(millis as u64))
}

/// Format a time-to-deadline as a `grpc-timeout` header value.
///
/// Picks the smallest unit whose value fits in 8 digits, rounding up so the
/// receiver never times out before the sender.
pub fn format_timeout(remaining: Duration) -> String {
    const UNITS: [(char, u128); 4] = [
        ('m', 1),
        ('S', 1_000),
        ('M', 60_000),
        ('H', 3_600_000),
    ];
    const LIMIT: u128 = 100_000_000;

    let millis = remaining.as_millis().min(MAX_TIMEOUT_MILLIS);
    for (unit, factor) in UNITS {
        let amount = millis.div_ceil(factor);
        if amount < LIMIT {
            return format!("{}{}", amount, unit);
        }
    }
    // Beyond 99 999 999 hours; clamp to the largest expressible value.
    format!("{}H", LIMIT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_units() {
        assert_eq!(parse_timeout("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_timeout("5M").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_timeout("30S").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_timeout("200m").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_timeout("5000u").unwrap(), Duration::from_millis(5));
        assert_eq!(
            parse_timeout("7000000n").unwrap(),
            Duration::from_millis(7)
        );
    }

    #[test]
    fn test_parse_sub_millisecond_truncates() {
        assert_eq!(parse_timeout("100u").unwrap(), Duration::ZERO);
        assert_eq!(parse_timeout("999999n").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_interior_whitespace() {
        assert_eq!(parse_timeout("100 m").unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "m", "100", "100x", "100mm", "-5m", "1.5S", " 100m", "100m "] {
            assert!(parse_timeout(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn test_parse_rejects_over_eight_digits() {
        assert!(parse_timeout("123456789m").is_err());
        assert!(parse_timeout("99999999m").is_ok());
    }

    #[test]
    fn test_parse_clamps_to_63_bits() {
        // 99 999 999 hours overflows the millisecond range; clamped.
        let d = parse_timeout("99999999H").unwrap();
        assert_eq!(d.as_millis(), i64::MAX as u128);
    }

    #[test]
    fn test_format_uses_smallest_fitting_unit() {
        assert_eq!(format_timeout(Duration::from_millis(100)), "100m");
        assert_eq!(format_timeout(Duration::from_millis(99_999_999)), "99999999m");
        assert_eq!(format_timeout(Duration::from_millis(100_000_000)), "100000S");
        assert_eq!(format_timeout(Duration::from_secs(100_000_000)), "1666667M");
    }

    #[test]
    fn test_format_rounds_up() {
        // 100 000 000 ms does not fit in 'm'; 100 000.0 s exactly fits 'S'.
        assert_eq!(format_timeout(Duration::from_millis(100_000_001)), "100001S");
    }

    #[test]
    fn test_roundtrip_within_one_unit() {
        for ms in [1u64, 9, 99, 1_000, 25_001, 99_999_999, 123_456_789] {
            let wire = format_timeout(Duration::from_millis(ms));
            let parsed = parse_timeout(&wire).unwrap().as_millis() as u64;
            // Rounded up by at most one unit of the chosen magnitude.
            assert!(parsed >= ms, "{wire}: {parsed} < {ms}");
            let unit = match wire.chars().last().unwrap() {
                'm' => 1,
                'S' => 1_000,
                'M' => 60_000,
                'H' => 3_600_000,
                _ => unreachable!(),
            };
            assert!(parsed - ms < unit, "{wire}: {parsed} too far above {ms}");
        }
    }
}
