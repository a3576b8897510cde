//! Float-seconds timestamps and the UTC string formats used on the TCS wire
//! and in archive paths.

use chrono::{DateTime, TimeZone, Utc};

pub fn datetime_to_f64<TZ>(dt: &DateTime<TZ>) -> f64
where
    TZ: TimeZone,
{
    let secs = dt.timestamp();
    let nsecs = dt.timestamp_subsec_nanos();
    (secs as f64) + (nsecs as f64 * 1e-9)
}

/// Timestamp format of the `start` acknowledgement, e.g. `2013-05-04_031415`.
pub fn format_start_utc(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d_%H%M%S").to_string()
}

/// Timestamp format of the per-tick status line.
pub fn format_status_utc(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Date-only directory stamp used below the data directory.
pub fn format_date_dir(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d").to_string()
}

/// Parse the `utc_cycle` value, `YYYY-MM-DD-HH:MM:SS.ffffff` UTC, into float
/// epoch seconds.
pub fn parse_utc_cycle(s: &str) -> Result<f64, chrono::ParseError> {
    let naive = chrono::NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d-%H:%M:%S%.f")?;
    Ok(datetime_to_f64(&naive.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_cycle_roundtrip() {
        let t = parse_utc_cycle("2013-05-04-03:14:15.250000").unwrap();
        let dt = Utc.timestamp_opt(t.floor() as i64, 0).unwrap();
        assert_eq!(format_status_utc(&dt), "2013-05-04 03:14:15");
        assert!((t.fract() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn start_utc_format() {
        let dt = Utc.with_ymd_and_hms(2013, 5, 4, 3, 14, 15).unwrap();
        assert_eq!(format_start_utc(&dt), "2013-05-04_031415");
        assert_eq!(format_date_dir(&dt), "2013-05-04");
    }

    #[test]
    fn f64_conversion_keeps_subsecond() {
        let dt = Utc.timestamp_opt(1_367_637_255, 500_000_000).unwrap();
        let t = datetime_to_f64(&dt);
        assert!((t - 1_367_637_255.5).abs() < 1e-9);
    }
}
