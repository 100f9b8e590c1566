//! Thread-safe metrics collection
//!
//! Atomic counters for task dispatch and broker connectivity, plus a bounded
//! window of task durations for latency percentiles.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_DURATION_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and a mutex-protected sample window
pub struct MetricsCollector {
    // Task dispatch
    tasks_received: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_rejected: AtomicU64,
    tasks_in_flight: AtomicU64,
    max_in_flight_reached: AtomicU64,

    // Broker
    broker_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnect_loops_started: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,

    task_durations: Mutex<Vec<u64>>, // in milliseconds
    started_at: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_received: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_rejected: AtomicU64::new(0),
            tasks_in_flight: AtomicU64::new(0),
            max_in_flight_reached: AtomicU64::new(0),
            broker_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnect_loops_started: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            task_durations: Mutex::new(Vec::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Task dispatch metrics
    pub fn task_received(&self) {
        self.tasks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        let in_flight = self.tasks_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight_reached
            .fetch_max(in_flight, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        // Saturate at zero; a reset during execution must not wrap the gauge
        let _ = self
            .tasks_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn task_succeeded(&self, duration: Duration) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration);
    }

    pub fn task_failed(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_rejected(&self) {
        self.tasks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, duration: Duration) {
        if let Ok(mut durations) = self.task_durations.lock() {
            durations.push(duration.as_millis() as u64);
            if durations.len() > MAX_DURATION_SAMPLES {
                durations.remove(0);
            }
        }
    }

    // Broker metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(true, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn reconnect_loop_started(&self) {
        self.reconnect_loops_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.tasks_received,
            &self.tasks_succeeded,
            &self.tasks_failed,
            &self.tasks_retried,
            &self.tasks_rejected,
            &self.tasks_in_flight,
            &self.max_in_flight_reached,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.reconnect_loops_started,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.broker_connected.store(false, Ordering::Relaxed);
        self.started_at.store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut durations) = self.task_durations.lock() {
            durations.clear();
        }
    }

    /// Calculate duration statistics: (avg, p50, p95, p99) in milliseconds
    fn duration_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(durations) = self.task_durations.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if durations.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = durations.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    /// Point-in-time copy of every metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg_ms, p50_ms, p95_ms, p99_ms) = self.duration_statistics();
        let now = current_timestamp();

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            tasks: TaskMetrics {
                received: self.tasks_received.load(Ordering::Relaxed),
                succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
                failed: self.tasks_failed.load(Ordering::Relaxed),
                retried: self.tasks_retried.load(Ordering::Relaxed),
                rejected: self.tasks_rejected.load(Ordering::Relaxed),
                in_flight: self.tasks_in_flight.load(Ordering::Relaxed),
                max_in_flight_reached: self.max_in_flight_reached.load(Ordering::Relaxed),
                avg_duration_ms: avg_ms,
                p50_duration_ms: p50_ms,
                p95_duration_ms: p95_ms,
                p99_duration_ms: p99_ms,
            },
            broker: BrokerMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnect_loops_started: self.reconnect_loops_started.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub tasks: TaskMetrics,
    pub broker: BrokerMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub rejected: u64,
    pub in_flight: u64,
    pub max_in_flight_reached: u64,
    pub avg_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnect_loops_started: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[index.min(sorted.len() - 1)] as f64
}
