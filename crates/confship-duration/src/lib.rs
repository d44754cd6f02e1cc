//! Human-readable byte-size and elapsed-time rendering.
//!
//! Both functions feed the deployment summary report, so their output is a
//! stable contract: `format_bytes` uses base-1024 units with two-decimal
//! precision, and `format_elapsed` renders the largest non-zero unit
//! together with the next smaller one.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use confship_duration::{format_bytes, format_elapsed};
//!
//! assert_eq!(format_bytes(1024), "1.00 KiB");
//! assert_eq!(format_elapsed(Duration::from_secs(187)), "3m and 7s");
//! ```

use std::time::Duration;

const SUFFIXES: [&str; 6] = ["Bytes", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format a byte count with base-1024 units and two decimals.
///
/// Zero is special-cased as `"0 Bytes"`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut idx = 0;
    while value >= 1024.0 && idx < SUFFIXES.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }

    format!("{:.2} {}", value, SUFFIXES[idx])
}

/// Format an elapsed duration as its largest non-zero unit plus the next
/// smaller one.
///
/// Days and hours use spelled-out unit words; minutes, seconds, and
/// milliseconds use `m`, `s`, and `ms`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_ms = elapsed.as_millis() as u64;

    let days = total_ms / 86_400_000;
    let hours = (total_ms % 86_400_000) / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;

    if days > 0 {
        format!(
            "{} {} and {} {}",
            days,
            plural(days, "day"),
            hours,
            plural(hours, "hour")
        )
    } else if hours > 0 {
        format!("{} {} and {}m", hours, plural(hours, "hour"), minutes)
    } else if minutes > 0 {
        format!("{minutes}m and {seconds}s")
    } else if seconds > 0 {
        format!("{seconds}s and {millis}ms")
    } else {
        format!("{millis}ms")
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        unit.to_string()
    } else {
        format!("{unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn format_bytes_honors_the_table() {
        assert_eq!(format_bytes(0), "0 Bytes");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(1_048_576), "1.00 MiB");
        assert_eq!(format_bytes(1_099_511_627_776), "1.00 TiB");
    }

    #[test]
    fn format_bytes_keeps_two_decimals_below_a_unit() {
        assert_eq!(format_bytes(512), "512.00 Bytes");
        assert_eq!(format_bytes(1536), "1.50 KiB");
    }

    #[test]
    fn format_elapsed_pairs_adjacent_units() {
        assert_eq!(format_elapsed(Duration::from_secs(187)), "3m and 7s");
        assert_eq!(format_elapsed(Duration::from_millis(2_500)), "2s and 500ms");
        assert_eq!(format_elapsed(Duration::from_millis(42)), "42ms");
    }

    #[test]
    fn format_elapsed_spells_out_days_and_hours() {
        assert_eq!(
            format_elapsed(Duration::from_secs(90_000)),
            "1 day and 1 hour"
        );
        assert_eq!(
            format_elapsed(Duration::from_secs(2 * 86_400 + 5 * 3600)),
            "2 days and 5 hours"
        );
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 120)), "3 hours and 2m");
    }

    proptest! {
        // Monotonicity: more bytes never renders as a smaller quantity.
        #[test]
        fn format_bytes_is_monotone(a in 0u64..u64::MAX / 2, delta in 0u64..1_000_000u64) {
            let parse = |s: &str| -> (usize, f64) {
                let mut parts = s.splitn(2, ' ');
                let value: f64 = parts.next().unwrap().parse().unwrap();
                let suffix = parts.next().unwrap();
                let rank = SUFFIXES.iter().position(|u| *u == suffix).unwrap();
                (rank, value)
            };
            let (rank_a, value_a) = parse(&format_bytes(a));
            let (rank_b, value_b) = parse(&format_bytes(a + delta));
            prop_assert!(rank_b > rank_a || (rank_b == rank_a && value_b >= value_a));
        }

        #[test]
        fn format_elapsed_never_panics(ms in 0u64..u64::MAX / 1_000_000) {
            let _ = format_elapsed(Duration::from_millis(ms));
        }
    }
}
