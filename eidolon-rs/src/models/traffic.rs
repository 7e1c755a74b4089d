//! Traffic samples and formatting helpers

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// One append-only usage sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub id: i64,
    pub user_id: i64,
    pub bytes: i64,
    pub timestamp: DateTime<Utc>,
}

/// Human readable byte count (binary units)
pub fn format_bytes(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let b = bytes as f64;
    if b >= TB {
        format!("{:.2} TB", b / TB)
    } else if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Parse a byte count such as `1048576`, `500MB` or `1.5 GB` (binary units)
pub fn parse_bytes(input: &str) -> Option<i64> {
    let s = input.trim().to_ascii_uppercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "K" | "KB" => 1024.0,
        "M" | "MB" => 1024.0 * 1024.0,
        "G" | "GB" => 1024.0 * 1024.0 * 1024.0,
        "T" | "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    let value: f64 = number.parse().ok()?;
    let bytes = (value * multiplier).round();
    if bytes.is_finite() && bytes >= 0.0 && bytes <= i64::MAX as f64 {
        Some(bytes as i64)
    } else {
        None
    }
}

/// Time range ending now for a named period; unknown periods mean 30 days
pub fn period_range(period: &str) -> (DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    let from = match period {
        "day" => now - Duration::days(1),
        "week" => now - Duration::days(7),
        "month" => now.checked_sub_months(Months::new(1)).unwrap_or(now - Duration::days(30)),
        "year" => now.checked_sub_months(Months::new(12)).unwrap_or(now - Duration::days(365)),
        _ => now - Duration::days(30),
    };

    (from, now)
}

/// Sum of sample sizes
pub fn total_bytes(samples: &[UserTraffic]) -> i64 {
    samples.iter().map(|s| s.bytes).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("1048576"), Some(1_048_576));
        assert_eq!(parse_bytes("500MB"), Some(500 * 1024 * 1024));
        assert_eq!(parse_bytes("1.5 gb"), Some(1_610_612_736));
        assert_eq!(parse_bytes("0"), Some(0));
        assert_eq!(parse_bytes("12 parsecs"), None);
        assert_eq!(parse_bytes("-5"), None);
        assert_eq!(parse_bytes(""), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024 * 1024), "2.00 TB");
    }

    #[test]
    fn test_period_range_defaults_to_thirty_days() {
        let (from, to) = period_range("fortnight");
        assert_eq!((to - from).num_days(), 30);

        let (from, to) = period_range("week");
        assert_eq!((to - from).num_days(), 7);
    }
}
