//! Sexagesimal coordinate strings as sent by TCS.

#[derive(thiserror::Error, Debug)]
#[error("cannot parse coordinate {value:?}")]
pub struct CoordParseError {
    value: String,
}

fn parse_fields(s: &str) -> Result<(f64, f64, f64), CoordParseError> {
    let err = || CoordParseError {
        value: s.to_string(),
    };
    let mut it = s.trim().split(':');
    let first = it.next().ok_or_else(err)?;
    let minutes: f64 = it.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let seconds: f64 = match it.next() {
        Some(sec) => sec.parse().map_err(|_| err())?,
        None => 0.0,
    };
    if it.next().is_some() || !(0.0..60.0).contains(&minutes) || !(0.0..60.0).contains(&seconds) {
        return Err(err());
    }
    // The leading field carries the sign, which must also apply to the
    // minutes and seconds ("-00:30:00" is negative).
    let negative = first.trim_start().starts_with('-');
    let whole: f64 = first.trim().parse().map_err(|_| err())?;
    let magnitude = whole.abs() + minutes / 60.0 + seconds / 3600.0;
    Ok((whole, magnitude, if negative { -1.0 } else { 1.0 }))
}

/// Right ascension `HH:MM:SS.S` to decimal degrees.
pub fn ra_to_degrees(s: &str) -> Result<f64, CoordParseError> {
    let (hours, magnitude, sign) = parse_fields(s)?;
    if !(0.0..24.0).contains(&hours) {
        return Err(CoordParseError {
            value: s.to_string(),
        });
    }
    Ok(sign * magnitude * 15.0)
}

/// Declination `[+|-]DD:MM:SS.S` to decimal degrees.
pub fn dec_to_degrees(s: &str) -> Result<f64, CoordParseError> {
    let (degrees, magnitude, sign) = parse_fields(s)?;
    if degrees.abs() > 90.0 {
        return Err(CoordParseError {
            value: s.to_string(),
        });
    }
    Ok(sign * magnitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ra_hours_to_degrees() {
        assert!((ra_to_degrees("12:00:00").unwrap() - 180.0).abs() < 1e-9);
        let ra = ra_to_degrees("12:34:56.7").unwrap();
        let expect = (12.0 + 34.0 / 60.0 + 56.7 / 3600.0) * 15.0;
        assert!((ra - expect).abs() < 1e-9);
    }

    #[test]
    fn dec_keeps_sign_on_minutes() {
        assert!((dec_to_degrees("-45:00:00").unwrap() + 45.0).abs() < 1e-9);
        assert!((dec_to_degrees("-00:30:00").unwrap() + 0.5).abs() < 1e-9);
        assert!((dec_to_degrees("+10:30").unwrap() - 10.5).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(ra_to_degrees("25:00:00").is_err());
        assert!(dec_to_degrees("91:00:00").is_err());
        assert!(dec_to_degrees("10:61:00").is_err());
        assert!(ra_to_degrees("garbage").is_err());
    }
}
