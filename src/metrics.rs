//! Streaming timing statistics and run counters.
//!
//! Every timing sample of a run lands in one [`RunningStatistics`] accumulator per
//! [`TimingCategory`]. Accumulators are independent: each one has its own lock, so
//! send tasks recording message-send samples never contend with the receive side
//! recording round trips.
//!
//! Mean and variance use Welford's online update, which stays numerically stable
//! over long runs without keeping the samples around. An HDR histogram next to the
//! Welford state provides percentiles for the report.

use hdrhistogram::{CreationError, Histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Percentiles reported for every category
pub const REPORTED_PERCENTILES: [f64; 3] = [50.0, 95.0, 99.0];

/// What a timing sample measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingCategory {
    /// Opening a transport connection (TCP connect, greeting, EHLO, TLS, AUTH)
    ConnectionSetup,
    /// Per-connection time not spent stamping or transmitting messages
    ConnectionHandling,
    /// One message transmission, MAIL FROM through the final DATA reply
    MessageSend,
    /// Time the inbound listener spent reading one message body
    MessageReceive,
    /// Send completion to observed delivery
    RoundTrip,
}

impl TimingCategory {
    pub const ALL: [TimingCategory; 5] = [
        TimingCategory::ConnectionSetup,
        TimingCategory::ConnectionHandling,
        TimingCategory::MessageSend,
        TimingCategory::MessageReceive,
        TimingCategory::RoundTrip,
    ];

    fn index(self) -> usize {
        match self {
            TimingCategory::ConnectionSetup => 0,
            TimingCategory::ConnectionHandling => 1,
            TimingCategory::MessageSend => 2,
            TimingCategory::MessageReceive => 3,
            TimingCategory::RoundTrip => 4,
        }
    }
}

impl std::fmt::Display for TimingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimingCategory::ConnectionSetup => write!(f, "Connection setup"),
            TimingCategory::ConnectionHandling => write!(f, "Connection handling"),
            TimingCategory::MessageSend => write!(f, "Message send"),
            TimingCategory::MessageReceive => write!(f, "Message receive"),
            TimingCategory::RoundTrip => write!(f, "Round trip"),
        }
    }
}

/// Percentile value pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: u64,
}

/// Two-sided Student's t confidence interval around the mean
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    /// Confidence level as a fraction, `1 - α`
    pub level: f64,
    pub mean_ns: f64,
    pub margin_ns: f64,
}

impl ConfidenceInterval {
    pub fn lower_ns(&self) -> f64 {
        self.mean_ns - self.margin_ns
    }

    pub fn upper_ns(&self) -> f64 {
        self.mean_ns + self.margin_ns
    }
}

/// Quantile `p` of the Student's t distribution with `freedom` degrees of freedom
pub fn student_t_quantile(p: f64, freedom: f64) -> Option<f64> {
    let distribution = StudentsT::new(0.0, 1.0, freedom).ok()?;
    let quantile = distribution.inverse_cdf(p);
    quantile.is_finite().then_some(quantile)
}

/// `mean ± t(1-α/2, n-1) · s / √n`, or `None` when `n ≤ 1` leaves nothing to evaluate
pub fn confidence_interval(
    count: u64,
    mean_ns: f64,
    std_dev_ns: f64,
    significance: f64,
) -> Option<ConfidenceInterval> {
    if count <= 1 || !(significance > 0.0 && significance < 1.0) {
        return None;
    }
    let t = student_t_quantile(1.0 - significance / 2.0, (count - 1) as f64)?;
    Some(ConfidenceInterval {
        level: 1.0 - significance,
        mean_ns,
        margin_ns: t * std_dev_ns / (count as f64).sqrt(),
    })
}

/// Point-in-time view of one category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStatistics {
    pub category: TimingCategory,
    pub count: u64,
    pub sum_ns: u64,
    pub mean_ns: Option<f64>,
    pub min_ns: Option<u64>,
    pub max_ns: Option<u64>,
    /// Sample variance (n-1 denominator); undefined below two samples
    pub variance_ns2: Option<f64>,
    pub std_dev_ns: Option<f64>,
    pub confidence: Option<ConfidenceInterval>,
    pub percentiles: Vec<PercentileValue>,
}

struct Accumulator {
    count: u64,
    sum_ns: u64,
    mean: f64,
    m2: f64,
    min_ns: u64,
    max_ns: u64,
    histogram: Histogram<u64>,
}

impl Accumulator {
    fn add(&mut self, value_ns: u64) {
        self.count += 1;
        let x = value_ns as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.sum_ns = self.sum_ns.saturating_add(value_ns);
        self.min_ns = self.min_ns.min(value_ns);
        self.max_ns = self.max_ns.max(value_ns);
        self.histogram.saturating_record(value_ns);
    }
}

/// Thread-safe Welford accumulator for one category.
///
/// Each sample is applied under a short critical section so count, mean and M2
/// always move together; no update can be lost between concurrent writers.
pub struct RunningStatistics {
    category: TimingCategory,
    state: Mutex<Accumulator>,
}

impl RunningStatistics {
    pub fn new(category: TimingCategory) -> Result<Self, CreationError> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;
        Ok(Self {
            category,
            state: Mutex::new(Accumulator {
                count: 0,
                sum_ns: 0,
                mean: 0.0,
                m2: 0.0,
                min_ns: u64::MAX,
                max_ns: 0,
                histogram,
            }),
        })
    }

    pub fn add_sample(&self, value_ns: u64) {
        self.state.lock().add(value_ns);
    }

    pub fn record(&self, elapsed: Duration) {
        self.add_sample(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn snapshot(&self, significance: f64) -> CategoryStatistics {
        let state = self.state.lock();
        let count = state.count;

        let (mean_ns, min_ns, max_ns) = if count == 0 {
            (None, None, None)
        } else {
            (Some(state.mean), Some(state.min_ns), Some(state.max_ns))
        };

        let variance_ns2 = (count > 1).then(|| state.m2 / (count - 1) as f64);
        let std_dev_ns = variance_ns2.map(f64::sqrt);

        let confidence = match (mean_ns, std_dev_ns) {
            (Some(mean), Some(std_dev)) => confidence_interval(count, mean, std_dev, significance),
            _ => None,
        };

        let percentiles = if count == 0 {
            Vec::new()
        } else {
            REPORTED_PERCENTILES
                .iter()
                .map(|&p| PercentileValue {
                    percentile: p,
                    value_ns: state.histogram.value_at_percentile(p),
                })
                .collect()
        };

        CategoryStatistics {
            category: self.category,
            count,
            sum_ns: state.sum_ns,
            mean_ns,
            min_ns,
            max_ns,
            variance_ns2,
            std_dev_ns,
            confidence,
            percentiles,
        }
    }
}

/// One accumulator per timing category
pub struct Statistics {
    categories: Vec<RunningStatistics>,
}

impl Statistics {
    pub fn new() -> Result<Self, CreationError> {
        let categories = TimingCategory::ALL
            .iter()
            .map(|&category| RunningStatistics::new(category))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { categories })
    }

    pub fn category(&self, category: TimingCategory) -> &RunningStatistics {
        &self.categories[category.index()]
    }

    pub fn record(&self, category: TimingCategory, elapsed: Duration) {
        self.category(category).record(elapsed);
    }

    pub fn snapshot(&self, significance: f64) -> Vec<CategoryStatistics> {
        self.categories
            .iter()
            .map(|stats| stats.snapshot(significance))
            .collect()
    }
}

/// Event rates derived from a category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub events: u64,
    /// Events over the elapsed wall-clock time of the run
    pub per_second_wall_time: f64,
    /// Events over the summed duration of the events themselves
    pub per_second_real_time: f64,
}

impl ThroughputMetrics {
    pub fn compute(events: u64, wall: Duration, busy_ns: u64) -> Self {
        let wall_secs = wall.as_secs_f64();
        let busy_secs = busy_ns as f64 / 1_000_000_000.0;
        Self {
            events,
            per_second_wall_time: if wall_secs > 0.0 {
                events as f64 / wall_secs
            } else {
                0.0
            },
            per_second_real_time: if busy_secs > 0.0 {
                events as f64 / busy_secs
            } else {
                0.0
            },
        }
    }
}

/// Event counters shared by every worker of a run
#[derive(Debug, Default)]
pub struct RunCounters {
    pub messages_sent: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub messages_failed: AtomicU64,
    pub connections_dispatched: AtomicU64,
    pub connections_established: AtomicU64,
    pub connections_failed: AtomicU64,
    pub messages_received: AtomicU64,
    pub receive_failures: AtomicU64,
    pub duplicate_deliveries: AtomicU64,
}

/// Increment a run counter
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RunCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            messages_sent: load(&self.messages_sent),
            messages_delivered: load(&self.messages_delivered),
            messages_failed: load(&self.messages_failed),
            connections_dispatched: load(&self.connections_dispatched),
            connections_established: load(&self.connections_established),
            connections_failed: load(&self.connections_failed),
            messages_received: load(&self.messages_received),
            receive_failures: load(&self.receive_failures),
            duplicate_deliveries: load(&self.duplicate_deliveries),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub connections_dispatched: u64,
    pub connections_established: u64,
    pub connections_failed: u64,
    pub messages_received: u64,
    pub receive_failures: u64,
    pub duplicate_deliveries: u64,
}
