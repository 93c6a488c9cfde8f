//! Final run report.
//!
//! A [`RunReport`] is assembled once, after the send phase and the optional
//! receive phase are quiescent. It renders as the human-readable console report
//! and can additionally be written as JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::correlation::CorrelationSummary;
use crate::metrics::{CategoryStatistics, CounterSnapshot, Statistics, ThroughputMetrics, TimingCategory};
use crate::utils::{format_duration, format_duration_ns, format_message_rate, generate_run_id};

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub container: bool,
    pub sampler_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            container: crate::utils::is_container_environment(),
            sampler_version: crate::VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub system: SystemInfo,
}

impl ReportMetadata {
    pub fn new() -> Self {
        Self {
            run_id: generate_run_id(),
            timestamp: Utc::now(),
            system: SystemInfo::collect(),
        }
    }
}

impl Default for ReportMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Options the run was started with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationSummary {
    pub endpoint: String,
    pub starttls: bool,
    pub auth: bool,
    pub messages: usize,
    pub connections: usize,
    pub messages_per_connection: usize,
    pub batches: usize,
    pub timeout: Option<Duration>,
    pub listener: Option<String>,
    pub header_name: String,
    pub significance: f64,
}

/// Waiting for deliveries after the send phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReceivePhaseSummary {
    /// Every expected message arrived before the deadline
    pub completed: bool,
    pub deadline: Duration,
    pub elapsed: Duration,
    pub outstanding: usize,
}

/// Statistics and rates of one timing category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryReport {
    pub statistics: CategoryStatistics,
    pub throughput: ThroughputMetrics,
}

impl CategoryReport {
    pub fn from_statistics(statistics: CategoryStatistics, wall_time: Duration) -> Self {
        let throughput = ThroughputMetrics::compute(statistics.count, wall_time, statistics.sum_ns);
        Self {
            statistics,
            throughput,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub metadata: ReportMetadata,
    pub configuration: ConfigurationSummary,
    pub wall_time: Duration,
    pub send_phase_time: Duration,
    pub receive_phase: Option<ReceivePhaseSummary>,
    pub counters: CounterSnapshot,
    pub correlation: Option<CorrelationSummary>,
    pub categories: Vec<CategoryReport>,
    /// Messages handed to the server over wall time
    pub throughput: ThroughputMetrics,
}

impl RunReport {
    /// Snapshot every category of `statistics` into a report
    pub fn new(
        configuration: ConfigurationSummary,
        statistics: &Statistics,
        counters: CounterSnapshot,
        wall_time: Duration,
        send_phase_time: Duration,
        receive_phase: Option<ReceivePhaseSummary>,
        correlation: Option<CorrelationSummary>,
    ) -> Self {
        let categories: Vec<CategoryReport> = statistics
            .snapshot(configuration.significance)
            .into_iter()
            .map(|stats| CategoryReport::from_statistics(stats, wall_time))
            .collect();
        let send_ns = categories
            .iter()
            .find(|c| c.statistics.category == TimingCategory::MessageSend)
            .map(|c| c.statistics.sum_ns)
            .unwrap_or(0);

        Self {
            metadata: ReportMetadata::new(),
            throughput: ThroughputMetrics::compute(counters.messages_sent, wall_time, send_ns),
            configuration,
            wall_time,
            send_phase_time,
            receive_phase,
            counters,
            correlation,
            categories,
        }
    }

    pub fn category(&self, category: TimingCategory) -> Option<&CategoryReport> {
        self.categories
            .iter()
            .find(|c| c.statistics.category == category)
    }

    /// Write the report as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
        Ok(())
    }
}

fn write_category(f: &mut fmt::Formatter<'_>, report: &CategoryReport) -> fmt::Result {
    let stats = &report.statistics;
    writeln!(f, "{}:", stats.category)?;
    writeln!(f, "  Samples: {}", stats.count)?;

    let (Some(mean), Some(min), Some(max)) = (stats.mean_ns, stats.min_ns, stats.max_ns) else {
        return writeln!(f, "  No samples");
    };
    writeln!(f, "  Average: {}", format_duration_ns(mean))?;
    writeln!(
        f,
        "  Min: {}  Max: {}",
        format_duration(Duration::from_nanos(min)),
        format_duration(Duration::from_nanos(max))
    )?;
    match stats.std_dev_ns {
        Some(std_dev) => writeln!(f, "  Std dev: {}", format_duration_ns(std_dev))?,
        None => writeln!(f, "  Std dev: no evaluation")?,
    }
    match &stats.confidence {
        Some(ci) => writeln!(
            f,
            "  Confidence interval: {} ± {} ({:.1}% confidence)",
            format_duration_ns(ci.mean_ns),
            format_duration_ns(ci.margin_ns),
            ci.level * 100.0
        )?,
        None => writeln!(f, "  Confidence interval: no evaluation")?,
    }
    if !stats.percentiles.is_empty() {
        let rendered: Vec<String> = stats
            .percentiles
            .iter()
            .map(|p| {
                format!(
                    "p{}: {}",
                    p.percentile,
                    format_duration(Duration::from_nanos(p.value_ns))
                )
            })
            .collect();
        writeln!(f, "  Percentiles: {}", rendered.join(", "))?;
    }
    writeln!(
        f,
        "  Throughput: {} on wall time, {} on real time",
        format_message_rate(report.throughput.per_second_wall_time),
        format_message_rate(report.throughput.per_second_real_time)
    )
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        let send_total = self
            .category(TimingCategory::MessageSend)
            .map(|r| Duration::from_nanos(r.statistics.sum_ns))
            .unwrap_or_default();

        writeln!(f, "Report:")?;
        writeln!(
            f,
            "Total time: {} (Wall Clock) - ({} total time)",
            format_duration(self.wall_time),
            format_duration(send_total)
        )?;
        writeln!(f, "Send phase: {}", format_duration(self.send_phase_time))?;
        if let Some(receive) = &self.receive_phase {
            if receive.completed {
                writeln!(f, "Round-trip phase: {}", format_duration(receive.elapsed))?;
            } else {
                writeln!(
                    f,
                    "Round-trip phase: {} (deadline {} elapsed, {} messages outstanding)",
                    format_duration(receive.elapsed),
                    format_duration(receive.deadline),
                    receive.outstanding
                )?;
            }
        }
        writeln!(f, "Total messages: {}", c.messages_sent)?;
        writeln!(f, "Delivered messages: {}", c.messages_delivered)?;
        writeln!(f, "Failed messages: {}", c.messages_failed)?;
        writeln!(
            f,
            "Connections: {} ({} established)",
            c.connections_dispatched, c.connections_established
        )?;
        writeln!(f, "Failed connections: {}", c.connections_failed)?;
        if let Some(correlation) = &self.correlation {
            writeln!(f, "Received messages: {}", c.messages_received)?;
            writeln!(f, "Received and matched messages: {}", correlation.matched)?;
            writeln!(f, "Failed received messages: {}", c.receive_failures)?;
            if c.duplicate_deliveries > 0 {
                writeln!(f, "Duplicate deliveries: {}", c.duplicate_deliveries)?;
            }
            if correlation.unmatched_received > 0 {
                writeln!(
                    f,
                    "Received messages never sent: {}",
                    correlation.unmatched_received
                )?;
            }
            if correlation.negative > 0 {
                writeln!(
                    f,
                    "Negative round trips discarded: {}",
                    correlation.negative
                )?;
            }
        }
        writeln!(
            f,
            "Total throughput: {}",
            format_message_rate(self.throughput.per_second_wall_time)
        )?;

        for report in &self.categories {
            if report.statistics.count == 0
                && matches!(
                    report.statistics.category,
                    TimingCategory::MessageReceive | TimingCategory::RoundTrip
                )
                && self.correlation.is_none()
            {
                continue;
            }
            writeln!(f)?;
            write_category(f, report)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration() -> ConfigurationSummary {
        ConfigurationSummary {
            endpoint: "localhost:25".to_string(),
            starttls: false,
            auth: false,
            messages: 5,
            connections: 1,
            messages_per_connection: 5,
            batches: 1,
            timeout: None,
            listener: None,
            header_name: "X-BENCHMARK-MESSAGE-ID".to_string(),
            significance: 0.05,
        }
    }

    fn report(with_correlation: bool) -> RunReport {
        let statistics = Statistics::new().unwrap();
        for ms in 1..=5 {
            statistics.record(TimingCategory::MessageSend, Duration::from_millis(ms));
        }
        statistics.record(TimingCategory::ConnectionSetup, Duration::from_millis(2));
        let counters = CounterSnapshot {
            messages_sent: 5,
            messages_delivered: 5,
            connections_dispatched: 1,
            connections_established: 1,
            ..CounterSnapshot::default()
        };
        RunReport::new(
            configuration(),
            &statistics,
            counters,
            Duration::from_millis(100),
            Duration::from_millis(90),
            None,
            with_correlation.then(CorrelationSummary::default),
        )
    }

    #[test]
    fn test_throughput_figures() {
        let report = report(false);
        // 5 messages over 100ms of wall time, 15ms of summed send time
        assert!((report.throughput.per_second_wall_time - 50.0).abs() < 1e-9);
        let send = report.category(TimingCategory::MessageSend).unwrap();
        assert!((send.throughput.per_second_real_time - 5.0 / 0.015).abs() < 1e-6);
    }

    #[test]
    fn test_console_rendering() {
        let rendered = report(false).to_string();
        assert!(rendered.starts_with("Report:\n"));
        assert!(rendered.contains("Total time: 100.00ms (Wall Clock) - (15.00ms total time)"));
        assert!(rendered.contains("Total messages: 5"));
        assert!(rendered.contains("Delivered messages: 5"));
        assert!(rendered.contains("Failed connections: 0"));
        assert!(rendered.contains("Total throughput: 50.00 msg/s"));
        assert!(rendered.contains("Message send:\n  Samples: 5\n  Average: 3.00ms"));
        assert!(rendered.contains("(95.0% confidence)"));
        // A single sample has no interval
        assert!(rendered.contains("Connection setup:\n  Samples: 1"));
        assert!(rendered.contains("Confidence interval: no evaluation"));
        assert!(!rendered.contains("Round trip:"));
    }

    #[test]
    fn test_round_trip_blocks_shown_with_listener() {
        let rendered = report(true).to_string();
        assert!(rendered.contains("Received and matched messages: 0"));
        assert!(rendered.contains("Round trip:\n  Samples: 0\n  No samples"));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report(true).write_json(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["counters"]["messages_sent"], 5);
        assert_eq!(json["categories"].as_array().unwrap().len(), 5);
        assert_eq!(json["metadata"]["system"]["sampler_version"], crate::VERSION);
        assert_eq!(json["categories"][2]["statistics"]["category"], "message_send");
    }
}
