//! Human-readable units for session log lines

use std::time::Duration;

const SIZE_UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

/// Render an elapsed time with one rounded unit, e.g. `850ms`, `1.2s`, `3.5m`
pub fn beautify_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();

    if d < Duration::from_millis(1) {
        format!("{}µs", d.as_micros())
    } else if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else if round_tenths(secs) < 60.0 {
        format!("{:.1}s", secs)
    } else if round_tenths(secs / 60.0) < 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Render a byte count in binary units, e.g. `512B`, `4.9KB`, `3.4MB`
pub fn beautify_size(n: u64) -> String {
    if n < 1024 {
        return format!("{}B", n);
    }

    let mut value = n as f64 / 1024.0;
    let mut unit = 0;
    while round_tenths(value) >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.1}{}", value, SIZE_UNITS[unit])
}

/// The value `{:.1}` will print, so unit choice matches the output
fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
