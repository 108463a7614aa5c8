use std::time::Duration;

/// Parse a duration string such as `"30s"`, `"1h30m"`, `"1.5h"` or `"250ms"`.
///
/// Accepted units: `ns`, `us` (`µs`, `μs`), `ms`, `s`, `m`, `h`. Every number
/// needs a unit. The result must be strictly positive, so `"0s"` and
/// negative values are rejected.
pub fn parse_interval(input: &str) -> Result<Duration, String> {
    let (negative, mut rest) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input.strip_prefix('+').unwrap_or(input)),
    };
    if rest.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_ns = 0f64;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_end];
        if number.is_empty() || number == "." {
            return Err(format!("invalid duration {:?}", input));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {:?}", input))?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration {:?}", input)),
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, input)),
        };
        total_ns += value * scale;
        rest = &rest[unit_end..];
    }

    if negative || total_ns < 1.0 {
        return Err(format!("duration {:?} is not positive", input));
    }
    if total_ns > u64::MAX as f64 {
        return Err(format!("duration {:?} overflows", input));
    }
    Ok(Duration::from_nanos(total_ns.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_interval("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_interval("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_interval("10µs").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_interval("7ns").unwrap(), Duration::from_nanos(7));
    }

    #[test]
    fn parses_compound_and_fractional() {
        assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("2m0.5s").unwrap(), Duration::from_millis(120_500));
        assert_eq!(parse_interval("+1s").unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "not-a-duration", "10", "s", "1x", "1.2.3s", "1 s", "."] {
            assert!(parse_interval(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn rejects_non_positive() {
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("-5s").is_err());
    }
}
