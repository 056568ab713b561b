// Copyright 2024, The Hermes Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use dashmap::DashMap;
use hermes_system::connection::ConnectionId;
use hermes_system::metrics::{
    AddressMetric, AddressStatus, Direction, Measurement, Metric, SourceMetrics, TargetMetrics,
    RESPONSES_ADDRESS,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The measurement windows every counter maintains
pub const DEFAULT_WINDOWS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

const BUCKETS_PER_WINDOW: u64 = 60;

fn seconds_since_epoch(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Debug, Default)]
struct Bucket {
    epoch: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
}

/// One rolling window: a ring of buckets, each covering `resolution`
/// seconds. A bucket is reset lazily the first time its slot is reused for
/// a newer epoch, so idle periods cost nothing and reads stay correct after
/// long silence. Counts are accurate to one bucket resolution.
#[derive(Debug)]
struct Window {
    length: Duration,
    resolution_s: u64,
    buckets: Vec<Bucket>,
}

impl Window {
    fn new(length: Duration) -> Self {
        let resolution_s = (length.as_secs() / BUCKETS_PER_WINDOW).max(1);
        let buckets = (0..BUCKETS_PER_WINDOW).map(|_| Bucket::default()).collect();
        Self {
            length,
            resolution_s,
            buckets,
        }
    }

    fn bucket(&self, epoch: u64) -> &Bucket {
        let idx = (epoch % BUCKETS_PER_WINDOW) as usize;
        // the ring is BUCKETS_PER_WINDOW long, the modulo keeps idx in range
        &self.buckets[idx]
    }

    fn record(&self, now_s: u64, success: bool) {
        let epoch = now_s / self.resolution_s;
        let bucket = self.bucket(epoch);
        let seen = bucket.epoch.load(Ordering::Acquire);
        if seen != epoch {
            // first hit on a reused slot resets it; losing the race is fine,
            // the winner has already reset for the same epoch
            if bucket
                .epoch
                .compare_exchange(seen, epoch, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                bucket.success.store(0, Ordering::Release);
                bucket.failure.store(0, Ordering::Release);
            }
        }
        if success {
            bucket.success.fetch_add(1, Ordering::AcqRel);
        } else {
            bucket.failure.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn count(&self, now_s: u64, success: bool) -> u64 {
        let newest = now_s / self.resolution_s;
        let oldest = newest.saturating_sub(BUCKETS_PER_WINDOW.saturating_sub(1));
        self.buckets
            .iter()
            .filter(|bucket| {
                let epoch = bucket.epoch.load(Ordering::Acquire);
                epoch >= oldest && epoch <= newest
            })
            .map(|bucket| {
                if success {
                    bucket.success.load(Ordering::Acquire)
                } else {
                    bucket.failure.load(Ordering::Acquire)
                }
            })
            .sum()
    }
}

/// A time-bucketed event counter over a fixed list of rolling windows.
///
/// `record` is lock-free and independent per counter; hot paths from many
/// tasks may hit the same counter concurrently.
#[derive(Debug)]
pub struct SlidingWindowCounter {
    windows: Vec<Window>,
}

impl Default for SlidingWindowCounter {
    fn default() -> Self {
        Self::new(&DEFAULT_WINDOWS)
    }
}

impl SlidingWindowCounter {
    /// A counter over the given windows
    #[must_use]
    pub fn new(windows: &[Duration]) -> Self {
        Self {
            windows: windows.iter().copied().map(Window::new).collect(),
        }
    }

    /// Counts one event at the current wall-clock time
    pub fn record(&self, success: bool) {
        self.record_at(SystemTime::now(), success);
    }

    /// Counts one event at the given time
    pub fn record_at(&self, at: SystemTime, success: bool) {
        let now_s = seconds_since_epoch(at);
        for window in &self.windows {
            window.record(now_s, success);
        }
    }

    /// The rolling counts per window, evaluated at the current wall-clock
    /// time
    #[must_use]
    pub fn measurements(&self, metric: Metric, success: bool) -> Vec<Measurement> {
        self.measurements_at(SystemTime::now(), metric, success)
    }

    /// The rolling counts per window, evaluated at the given time
    #[must_use]
    pub fn measurements_at(&self, at: SystemTime, metric: Metric, success: bool) -> Vec<Measurement> {
        let now_s = seconds_since_epoch(at);
        self.windows
            .iter()
            .map(|window| Measurement {
                metric,
                window: window.length,
                count: window.count(now_s, success),
                since: at.checked_sub(window.length).unwrap_or(UNIX_EPOCH),
            })
            .collect()
    }
}

/// Key of one counter in the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The connection the counter belongs to
    pub connection: ConnectionId,
    /// What is counted
    pub metric: Metric,
    /// Traffic direction
    pub direction: Direction,
    /// Source or target address, or [`RESPONSES_ADDRESS`]
    pub address: String,
}

/// Process-wide registry of sliding-window counters keyed by
/// `(connection, metric, direction, address)`.
///
/// The handle is cheap to clone; get-or-create is atomic. Registry
/// operations never fail. Lifecycle: created by the supervisor, handed down
/// to clients, stripped per connection on delete.
#[derive(Debug, Clone, Default)]
pub struct CounterRegistry {
    counters: Arc<DashMap<CounterKey, Arc<SlidingWindowCounter>>>,
}

impl CounterRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the counter for the given key, creating it on first use
    #[must_use]
    pub fn counter(
        &self,
        connection: &ConnectionId,
        metric: Metric,
        direction: Direction,
        address: &str,
    ) -> Arc<SlidingWindowCounter> {
        let key = CounterKey {
            connection: connection.clone(),
            metric,
            direction,
            address: address.to_string(),
        };
        self.counters
            .entry(key)
            .or_insert_with(|| Arc::new(SlidingWindowCounter::default()))
            .clone()
    }

    /// Counter for messages consumed from a source
    #[must_use]
    pub fn inbound_consumed(&self, connection: &ConnectionId, source: &str) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Consumed, Direction::Inbound, source)
    }

    /// Counter for inbound payload mappings
    #[must_use]
    pub fn inbound_mapped(&self, connection: &ConnectionId, source: &str) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Mapped, Direction::Inbound, source)
    }

    /// Counter for inbound messages dropped on purpose
    #[must_use]
    pub fn inbound_dropped(&self, connection: &ConnectionId, source: &str) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Dropped, Direction::Inbound, source)
    }

    /// Counter for outbound payload mappings
    #[must_use]
    pub fn outbound_mapped(&self, connection: &ConnectionId, target: &str) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Mapped, Direction::Outbound, target)
    }

    /// Counter for outbound messages that passed a target's filter
    #[must_use]
    pub fn outbound_filtered(&self, connection: &ConnectionId, target: &str) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Filtered, Direction::Outbound, target)
    }

    /// Counter for outbound messages dropped on purpose
    #[must_use]
    pub fn outbound_dropped(&self, connection: &ConnectionId, target: &str) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Dropped, Direction::Outbound, target)
    }

    /// Counter for messages published to a target
    #[must_use]
    pub fn outbound_published(&self, connection: &ConnectionId, target: &str) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Published, Direction::Outbound, target)
    }

    /// Counter for received responses
    #[must_use]
    pub fn response_consumed(&self, connection: &ConnectionId) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Consumed, Direction::Outbound, RESPONSES_ADDRESS)
    }

    /// Counter for responses discarded because nobody asked for a reply
    #[must_use]
    pub fn response_dropped(&self, connection: &ConnectionId) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Dropped, Direction::Outbound, RESPONSES_ADDRESS)
    }

    /// Counter for reverse-mapped responses
    #[must_use]
    pub fn response_mapped(&self, connection: &ConnectionId) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Mapped, Direction::Outbound, RESPONSES_ADDRESS)
    }

    /// Counter for responses published back to the originator
    #[must_use]
    pub fn response_published(&self, connection: &ConnectionId) -> Arc<SlidingWindowCounter> {
        self.counter(connection, Metric::Published, Direction::Outbound, RESPONSES_ADDRESS)
    }

    fn aggregate(
        &self,
        connection: &ConnectionId,
        direction: Direction,
        status: &AddressStatus,
    ) -> BTreeMap<String, AddressMetric> {
        let mut addresses: BTreeMap<String, AddressMetric> = BTreeMap::new();
        for entry in self.counters.iter() {
            let key = entry.key();
            if key.connection != *connection || key.direction != direction {
                continue;
            }
            let metric = addresses
                .entry(key.address.clone())
                .or_insert_with(|| AddressMetric {
                    status: status.status,
                    status_details: status.details.clone(),
                    in_status_since: status.since,
                    success: vec![],
                    failure: vec![],
                });
            metric.success.extend(entry.value().measurements(key.metric, true));
            metric.failure.extend(entry.value().measurements(key.metric, false));
        }
        for metric in addresses.values_mut() {
            metric.success.sort_by_key(|m| (m.metric.label(), m.window));
            metric.failure.sort_by_key(|m| (m.metric.label(), m.window));
        }
        addresses
    }

    /// Aggregates all inbound counters of a connection into per-address
    /// source metrics
    #[must_use]
    pub fn aggregate_sources(&self, connection: &ConnectionId, status: &AddressStatus) -> SourceMetrics {
        SourceMetrics {
            addresses: self.aggregate(connection, Direction::Inbound, status),
        }
    }

    /// Aggregates all outbound counters of a connection into per-address
    /// target metrics
    #[must_use]
    pub fn aggregate_targets(&self, connection: &ConnectionId, status: &AddressStatus) -> TargetMetrics {
        TargetMetrics {
            addresses: self.aggregate(connection, Direction::Outbound, status),
        }
    }

    /// Removes every counter of the given connection
    pub fn strip(&self, connection: &ConnectionId) {
        self.counters.retain(|key, _| key.connection != *connection);
    }

    /// Number of registered counters, across all connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True if no counters are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hermes_system::connection::ConnectionStatus;

    fn at(seconds: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(seconds)
    }

    fn minute_count(counter: &SlidingWindowCounter, now: SystemTime, success: bool) -> u64 {
        counter
            .measurements_at(now, Metric::Published, success)
            .first()
            .map(|m| m.count)
            .unwrap_or_default()
    }

    #[test]
    fn counts_within_the_window() {
        let counter = SlidingWindowCounter::default();
        let start = 1_000_000;
        for i in 0..10 {
            counter.record_at(at(start + i), true);
        }
        counter.record_at(at(start + 10), false);
        assert_eq!(minute_count(&counter, at(start + 10), true), 10);
        assert_eq!(minute_count(&counter, at(start + 10), false), 1);
    }

    #[test]
    fn old_events_fall_out_of_the_minute_window() {
        let counter = SlidingWindowCounter::default();
        let start = 2_000_000;
        counter.record_at(at(start), true);
        assert_eq!(minute_count(&counter, at(start), true), 1);
        // two minutes later the event is gone from the minute window but
        // still visible in the hour window
        let later = at(start + 120);
        assert_eq!(minute_count(&counter, later, true), 0);
        let hour = counter
            .measurements_at(later, Metric::Published, true)
            .get(1)
            .map(|m| m.count)
            .unwrap_or_default();
        assert_eq!(hour, 1);
    }

    #[test]
    fn idle_periods_prune_lazily_on_read() {
        let counter = SlidingWindowCounter::default();
        let start = 3_000_000;
        for i in 0..5 {
            counter.record_at(at(start + i), true);
        }
        // nothing recorded for a day; reads must not resurrect old buckets
        let much_later = at(start + 2 * 24 * 60 * 60);
        for measurement in counter.measurements_at(much_later, Metric::Published, true) {
            assert_eq!(measurement.count, 0, "window {:?}", measurement.window);
        }
    }

    #[test]
    fn windows_report_their_start() {
        let counter = SlidingWindowCounter::default();
        let now = at(4_000_000);
        let measurements = counter.measurements_at(now, Metric::Consumed, true);
        assert_eq!(measurements.len(), DEFAULT_WINDOWS.len());
        for (measurement, window) in measurements.iter().zip(DEFAULT_WINDOWS) {
            assert_eq!(measurement.window, window);
            assert_eq!(measurement.since, now - window);
        }
    }

    #[test]
    fn registry_returns_the_same_counter_for_the_same_key() {
        let registry = CounterRegistry::new();
        let id = ConnectionId::new("conn-1");
        let a = registry.outbound_published(&id, "/ack");
        let b = registry.outbound_published(&id, "/ack");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn aggregation_groups_by_address_and_direction() {
        let registry = CounterRegistry::new();
        let id = ConnectionId::new("conn-1");
        // aggregation reads at the wall clock, so record there too
        registry.outbound_published(&id, "/ack").record(true);
        registry.outbound_published(&id, "/ack").record(false);
        registry.response_consumed(&id).record(true);
        registry.inbound_consumed(&id, "queue-a").record(true);

        let status = AddressStatus {
            status: ConnectionStatus::Open,
            details: None,
            since: SystemTime::now(),
        };
        let targets = registry.aggregate_targets(&id, &status);
        assert_eq!(targets.addresses.len(), 2);
        let ack = &targets.addresses["/ack"];
        assert_eq!(ack.success.first().map(|m| m.count), Some(1));
        assert_eq!(ack.failure.first().map(|m| m.count), Some(1));
        assert!(targets.addresses.contains_key(RESPONSES_ADDRESS));

        let sources = registry.aggregate_sources(&id, &status);
        assert_eq!(sources.addresses.len(), 1);
        assert!(sources.addresses.contains_key("queue-a"));
    }

    #[test]
    fn strip_removes_only_the_given_connection() {
        let registry = CounterRegistry::new();
        let one = ConnectionId::new("conn-1");
        let two = ConnectionId::new("conn-2");
        let _ = registry.outbound_published(&one, "/a");
        let _ = registry.outbound_published(&two, "/b");
        registry.strip(&one);
        assert_eq!(registry.len(), 1);
        let status = AddressStatus {
            status: ConnectionStatus::Closed,
            details: None,
            since: SystemTime::now(),
        };
        assert!(registry.aggregate_targets(&one, &status).addresses.is_empty());
        assert!(!registry.aggregate_targets(&two, &status).addresses.is_empty());
    }
}
