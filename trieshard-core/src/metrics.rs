//! Prometheus metrics for monitoring
//!
//! Counters, gauges and histograms rendered in the Prometheus text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    /// Sum of observations in microseconds
    sum: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with buckets suited to in-memory event handling
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1],
        )
    }

    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        Self {
            buckets: bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Observe a value in seconds
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Time a closure and record the duration
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Manager metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static ALIVE_WORKERS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("trieshard_alive_workers", "Number of workers acknowledging heartbeats")
    });

    pub static SHARDS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("trieshard_shards", "Number of shards in the committed partition")
    });

    pub static ACTIVE_SPLITS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("trieshard_active_splits", "Split operations awaiting acknowledgment")
    });

    pub static SPLITS_COMMITTED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("trieshard_splits_committed_total", "Total splits committed")
    });

    pub static SPLITS_FAILED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("trieshard_splits_failed_total", "Total splits failed or timed out")
    });

    pub static WORKERS_EVICTED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("trieshard_workers_evicted_total", "Total workers declared dead")
    });

    pub static EVENTS_PROCESSED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("trieshard_events_processed_total", "Events handled by the manager loop")
    });

    pub static EVENT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("trieshard_event_duration_seconds", "Time spent applying one event")
    });
}

/// Render every manager metric
pub fn gather_metrics() -> String {
    let mut output = String::new();

    output.push_str(&standard::ALIVE_WORKERS.to_prometheus());
    output.push_str(&standard::SHARDS.to_prometheus());
    output.push_str(&standard::ACTIVE_SPLITS.to_prometheus());

    output.push_str(&standard::SPLITS_COMMITTED.to_prometheus());
    output.push_str(&standard::SPLITS_FAILED.to_prometheus());
    output.push_str(&standard::WORKERS_EVICTED.to_prometheus());
    output.push_str(&standard::EVENTS_PROCESSED.to_prometheus());

    output.push_str(&standard::EVENT_DURATION.to_prometheus());

    output
}
