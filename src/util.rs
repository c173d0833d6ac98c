use std::time::Duration;

use chrono::{DateTime, Local};
use tracing_subscriber::{EnvFilter, fmt};

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).without_time().try_init();
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if secs > 0 {
        format!("{seconds}s")
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Epoch milliseconds as local wall-clock time.
pub fn format_epoch_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|utc| {
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "n/a".to_string())
}

/// Shortens to at most `max_chars` characters, ending in `...` when cut.
pub fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars <= 3 {
        return input.chars().take(max_chars).collect();
    }
    let head: String = input.chars().take(max_chars - 3).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_formatting() {
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(1_500_000), "1.5M");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(human_duration(Duration::from_millis(42)), "42ms");
        assert_eq!(human_duration(Duration::from_secs(75)), "1m 15s");
        assert_eq!(human_duration(Duration::from_secs(3 * 3_600 + 120)), "3h 2m");
        assert_eq!(human_duration(Duration::from_secs(2 * 86_400 + 3_600)), "2d 1h");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("explain this function", 10), "explain...");
        assert_eq!(truncate("ünïcødé text", 6), "ünï...");
        assert_eq!(truncate("abcdef", 2), "ab");
    }

    #[test]
    fn invalid_epoch_is_not_formatted() {
        assert_eq!(format_epoch_millis(i64::MAX), "n/a");
        assert_ne!(format_epoch_millis(1_700_000_000_000), "n/a");
    }
}
