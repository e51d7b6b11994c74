//! Utility functions

const UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Bytes in a human readable format, using powers of 1000.
pub fn to_human_readable(n: u64) -> String {
    if n < 1000 {
        return format!("{n} B");
    }

    let mut n = n as f64;
    let mut unit = 0;

    // round before comparing so 999_999 shows as 1.00 MB and not 1000.00 KB
    while (n * 10.0).round() / 10.0 >= 1000.0 && unit < UNITS.len() - 1 {
        n /= 1000.0;
        unit += 1;
    }

    format!("{n:.2} {}", UNITS[unit])
}

/// A transfer rate, `bytes` moved during `secs`.
pub fn to_human_rate(bytes: u64, secs: f64) -> String {
    if secs <= 0.0 {
        return "0 B/s".to_owned();
    }
    let rate = (bytes as f64 / secs).round() as u64;
    format!("{}/s", to_human_readable(rate))
}
