//! Send/receive correlation.
//!
//! Send tasks record the instant each message finished sending in a
//! [`TimestampTable`]; the [`ReceiveCorrelator`] records the instant each message
//! was delivered in a second table. Once both phases are quiescent, [`correlate`]
//! joins the two by identifier and feeds round-trip samples into the statistics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::ids::MessageId;
use crate::latch::CountdownLatch;
use crate::message::parse_message_id;
use crate::metrics::{bump, RunCounters, Statistics, TimingCategory};
use crate::transport::{Delivery, DeliverySink};

const SHARDS: usize = 16;

/// Concurrent identifier → instant map where the first write for a key wins.
///
/// Keys are spread over independently locked shards, so writers with distinct
/// identifiers rarely contend and no operation locks the whole table.
pub struct TimestampTable {
    shards: Vec<CachePadded<Mutex<HashMap<MessageId, Instant>>>>,
}

impl TimestampTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS)
                .map(|_| CachePadded::new(Mutex::new(HashMap::new())))
                .collect(),
        }
    }

    fn shard(&self, id: MessageId) -> &Mutex<HashMap<MessageId, Instant>> {
        &self.shards[(id % SHARDS as u64) as usize]
    }

    /// Store `at` for `id` unless a value is already present.
    ///
    /// Returns `true` if this call stored the value.
    pub fn insert_first(&self, id: MessageId, at: Instant) -> bool {
        let mut shard = self.shard(id).lock();
        match shard.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(at);
                true
            }
        }
    }

    pub fn get(&self, id: MessageId) -> Option<Instant> {
        self.shard(id).lock().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, in no particular order
    pub fn entries(&self) -> Vec<(MessageId, Instant)> {
        let mut entries = Vec::with_capacity(self.len());
        for shard in &self.shards {
            entries.extend(shard.lock().iter().map(|(id, at)| (*id, *at)));
        }
        entries
    }
}

impl Default for TimestampTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive side of a run: records deliveries and releases waiters once every
/// expected identifier has been seen.
pub struct ReceiveCorrelator {
    received: TimestampTable,
    expected: CountdownLatch,
    statistics: Arc<Statistics>,
    counters: Arc<RunCounters>,
}

impl ReceiveCorrelator {
    pub fn new(expected: usize, statistics: Arc<Statistics>, counters: Arc<RunCounters>) -> Self {
        Self {
            received: TimestampTable::new(),
            expected: CountdownLatch::new(expected),
            statistics,
            counters,
        }
    }

    /// Handle one delivery
    pub fn record(&self, header_value: Option<&str>, received_at: Instant) {
        bump(&self.counters.messages_received);

        let Some(id) = header_value.and_then(parse_message_id) else {
            bump(&self.counters.receive_failures);
            warn!(
                "Received message without a valid identifier header ({:?})",
                header_value
            );
            return;
        };

        if self.received.insert_first(id, received_at) {
            self.expected.count_down();
        } else {
            bump(&self.counters.duplicate_deliveries);
            debug!("Duplicate delivery of message {}", id);
        }
    }

    /// Wait until every expected message was received or `deadline` elapses.
    ///
    /// Returns `true` if nothing is outstanding.
    pub async fn await_all(&self, deadline: Duration) -> bool {
        self.expected.wait_timeout(deadline).await
    }

    pub fn outstanding(&self) -> usize {
        self.expected.count()
    }

    pub fn received(&self) -> &TimestampTable {
        &self.received
    }
}

impl DeliverySink for ReceiveCorrelator {
    fn on_delivery(&self, delivery: Delivery) {
        self.statistics
            .record(TimingCategory::MessageReceive, delivery.data_elapsed);
        self.record(delivery.header_value.as_deref(), delivery.received_at);
    }
}

/// Outcome of joining the send and receive tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationSummary {
    /// Identifiers present in both tables with a non-negative round trip
    pub matched: u64,
    /// Sent identifiers never received
    pub unmatched_sent: u64,
    /// Received identifiers that were never sent
    pub unmatched_received: u64,
    /// Identifiers received before they were recorded as sent
    pub negative: u64,
}

/// Join `sent` and `received` and record one round-trip sample per match.
///
/// A delivery instant earlier than the send instant is counted in
/// [`CorrelationSummary::negative`] and never recorded.
pub fn correlate(
    sent: &TimestampTable,
    received: &TimestampTable,
    statistics: &Statistics,
) -> CorrelationSummary {
    let mut summary = CorrelationSummary::default();

    for (id, sent_at) in sent.entries() {
        let Some(received_at) = received.get(id) else {
            summary.unmatched_sent += 1;
            continue;
        };
        match received_at.checked_duration_since(sent_at) {
            Some(round_trip) => {
                statistics.record(TimingCategory::RoundTrip, round_trip);
                summary.matched += 1;
            }
            None => {
                error!(
                    "Message {} was received {:?} before its send completed",
                    id,
                    sent_at.duration_since(received_at)
                );
                summary.negative += 1;
            }
        }
    }

    summary.unmatched_received = received
        .entries()
        .into_iter()
        .filter(|(id, _)| sent.get(*id).is_none())
        .count() as u64;

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(expected: usize) -> (ReceiveCorrelator, Arc<Statistics>, Arc<RunCounters>) {
        let statistics = Arc::new(Statistics::new().unwrap());
        let counters = Arc::new(RunCounters::default());
        (
            ReceiveCorrelator::new(expected, statistics.clone(), counters.clone()),
            statistics,
            counters,
        )
    }

    #[test]
    fn test_first_write_wins() {
        let table = TimestampTable::new();
        let first = Instant::now();
        let later = first + Duration::from_millis(5);
        assert!(table.insert_first(3, first));
        assert!(!table.insert_first(3, later));
        assert_eq!(table.get(3), Some(first));
        assert_eq!(table.len(), 1);
        assert!(table.get(4).is_none());
    }

    #[test]
    fn test_entries_span_shards() {
        let table = TimestampTable::new();
        let now = Instant::now();
        for id in 0..100 {
            table.insert_first(id, now);
        }
        let mut ids: Vec<_> = table.entries().into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_duplicates_and_failures() {
        let (correlator, _, counters) = fixture(2);
        let first = Instant::now();

        correlator.record(Some("1"), first);
        correlator.record(Some("1"), first + Duration::from_millis(3));
        correlator.record(None, first);
        correlator.record(Some("01"), first);
        assert_eq!(correlator.outstanding(), 1);
        assert_eq!(correlator.received().get(1), Some(first));

        correlator.record(Some("2"), first);
        assert!(correlator.await_all(Duration::from_millis(10)).await);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.messages_received, 5);
        assert_eq!(snapshot.receive_failures, 2);
        assert_eq!(snapshot.duplicate_deliveries, 1);
    }

    #[tokio::test]
    async fn test_await_all_times_out_on_loss() {
        let (correlator, _, _) = fixture(5);
        let now = Instant::now();
        for id in ["1", "2", "3"] {
            correlator.record(Some(id), now);
        }
        let started = Instant::now();
        assert!(!correlator.await_all(Duration::from_millis(200)).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(correlator.outstanding(), 2);
    }

    #[test]
    fn test_delivery_records_receive_timing() {
        let (correlator, statistics, _) = fixture(1);
        correlator.on_delivery(Delivery {
            header_value: Some("9".to_string()),
            received_at: Instant::now(),
            data_elapsed: Duration::from_micros(40),
            size: 10,
        });
        assert_eq!(
            statistics.category(TimingCategory::MessageReceive).count(),
            1
        );
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn test_correlate_joins_by_identifier() {
        let statistics = Statistics::new().unwrap();
        let sent = TimestampTable::new();
        let received = TimestampTable::new();
        let base = Instant::now();

        sent.insert_first(1, base);
        sent.insert_first(2, base);
        sent.insert_first(3, base + Duration::from_millis(50));
        sent.insert_first(4, base);
        received.insert_first(1, base + Duration::from_millis(10));
        received.insert_first(2, base + Duration::from_millis(30));
        // Received before it was sent
        received.insert_first(3, base);
        received.insert_first(99, base);

        let summary = correlate(&sent, &received, &statistics);
        assert_eq!(
            summary,
            CorrelationSummary {
                matched: 2,
                unmatched_sent: 1,
                unmatched_received: 1,
                negative: 1,
            }
        );

        let round_trip = statistics
            .category(TimingCategory::RoundTrip)
            .snapshot(0.05);
        assert_eq!(round_trip.count, 2);
        assert_eq!(round_trip.min_ns, Some(10_000_000));
        assert_eq!(round_trip.max_ns, Some(30_000_000));
        assert_eq!(round_trip.mean_ns, Some(20_000_000.0));
    }
}
