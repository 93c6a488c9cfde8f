//! # Utility Functions
//!
//! Formatting helpers for the console report and verbose log lines, plus the
//! small amount of host information recorded with every run.
//!
//! ## Usage Examples
//!
//! ```rust
//! use smtp_sampler::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_message_rate(15500.0), "15.50K msg/s");
//! ```

use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a run
///
/// ## Returns
/// String representation of a UUID v4 (e.g., "550e8400-e29b-41d4-a716-446655440000")
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration in a human-readable way
///
/// Converts a Duration to a human-readable string, automatically selecting
/// the most appropriate unit based on the magnitude.
///
/// ## Parameters
/// - `duration`: The Duration to format
///
/// ## Returns
/// Human-readable duration string with appropriate units and precision
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use smtp_sampler::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a fractional nanosecond value such as a mean or a margin
///
/// Negative and non-finite inputs are clamped to zero.
pub fn format_duration_ns(ns: f64) -> String {
    if !ns.is_finite() || ns <= 0.0 {
        return format_duration(Duration::ZERO);
    }
    format_duration(Duration::from_nanos(ns.round() as u64))
}

/// Format message throughput in a human-readable way
///
/// ## Parameters
/// - `messages_per_second`: Message rate as f64
///
/// ## Returns
/// Human-readable message rate string
///
/// ## Examples
///
/// ```rust
/// # use smtp_sampler::utils::format_message_rate;
/// assert_eq!(format_message_rate(750.0), "750.00 msg/s");
/// assert_eq!(format_message_rate(15500.0), "15.50K msg/s");
/// assert_eq!(format_message_rate(2300000.0), "2.30M msg/s");
/// ```
pub fn format_message_rate(messages_per_second: f64) -> String {
    if messages_per_second < 1000.0 {
        format!("{:.2} msg/s", messages_per_second)
    } else if messages_per_second < 1_000_000.0 {
        format!("{:.2}K msg/s", messages_per_second / 1000.0)
    } else {
        format!("{:.2}M msg/s", messages_per_second / 1_000_000.0)
    }
}

/// Get the number of logical CPU cores available to the process
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Check if we're running in a container environment
///
/// Looks for docker or lxc control groups of PID 1. If `/proc/1/cgroup` cannot
/// be read, assumes a non-container environment.
pub fn is_container_environment() -> bool {
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|contents| contents.contains("docker") || contents.contains("lxc"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_millis(50)), "50.00ms");
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.50s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_format_duration_ns() {
        assert_eq!(format_duration_ns(3.0), "3ns");
        assert_eq!(format_duration_ns(1_581.1), "1.58μs");
        assert_eq!(format_duration_ns(-1.0), "0ns");
        assert_eq!(format_duration_ns(f64::NAN), "0ns");
    }

    #[test]
    fn test_format_message_rate() {
        assert_eq!(format_message_rate(0.0), "0.00 msg/s");
        assert_eq!(format_message_rate(199.5), "199.50 msg/s");
        assert_eq!(format_message_rate(1500.0), "1.50K msg/s");
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
        assert!(get_cpu_cores() >= 1);
    }
}
