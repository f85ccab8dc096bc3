//! Process metrics and Prometheus exposition.
//!
//! A small typed registry: counters and gauges over atomics, fixed-bucket
//! histograms, and a hand-rendered text exposition served at `/metrics`.
//! The registry is plain process state constructed at startup; tests build
//! fresh instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Monotonic counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Integer gauge (connection counts and similar).
#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Floating-point gauge (lags, durations).
#[derive(Default)]
pub struct GaugeF64(AtomicU64);

impl GaugeF64 {
    pub fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Gauge with one label dimension (`{topic="orders"}`).
#[derive(Default)]
pub struct LabeledGauge {
    values: Mutex<HashMap<String, f64>>,
}

impl LabeledGauge {
    pub fn set(&self, label: &str, v: f64) {
        self.values
            .lock()
            .expect("lock poisoned")
            .insert(label.to_string(), v);
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.values.lock().expect("lock poisoned").get(label).copied()
    }

    pub fn remove(&self, label: &str) {
        self.values.lock().expect("lock poisoned").remove(label);
    }

    fn snapshot(&self) -> Vec<(String, f64)> {
        let mut pairs: Vec<_> = self
            .values
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

/// Fixed-bucket histogram.
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum_bits: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total: AtomicU64::new(0),
            sum_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn observe(&self, value: f64) {
        for (i, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.sum_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }
}

/// Duration-style buckets (seconds).
fn duration_buckets() -> Vec<f64> {
    vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
}

/// Queue-depth buckets.
fn depth_buckets() -> Vec<f64> {
    vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0]
}

/// The process metrics registry.
pub struct Metrics {
    pub events_produced_total: Counter,
    pub events_consumed_total: Counter,
    pub events_dead_lettered_total: Counter,
    pub push_messages_sent_total: Counter,
    pub push_send_failures_total: Counter,
    pub connections_open: Gauge,
    pub outbox_lag_seconds: GaugeF64,
    pub dlq_depth: LabeledGauge,
    pub stream_consumer_lag: LabeledGauge,
    pub circuit_state: LabeledGauge,
    pub bus_append_duration_seconds: Histogram,
    pub push_queue_depth: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_produced_total: Counter::default(),
            events_consumed_total: Counter::default(),
            events_dead_lettered_total: Counter::default(),
            push_messages_sent_total: Counter::default(),
            push_send_failures_total: Counter::default(),
            connections_open: Gauge::default(),
            outbox_lag_seconds: GaugeF64::default(),
            dlq_depth: LabeledGauge::default(),
            stream_consumer_lag: LabeledGauge::default(),
            circuit_state: LabeledGauge::default(),
            bus_append_duration_seconds: Histogram::new(duration_buckets()),
            push_queue_depth: Histogram::new(depth_buckets()),
        }
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);

        render_counter(
            &mut out,
            "pulse_events_produced_total",
            "Events published to the stream bus",
            &self.events_produced_total,
        );
        render_counter(
            &mut out,
            "pulse_events_consumed_total",
            "Events consumed by dispatchers",
            &self.events_consumed_total,
        );
        render_counter(
            &mut out,
            "pulse_events_dead_lettered_total",
            "Events moved to the dead-letter queue",
            &self.events_dead_lettered_total,
        );
        render_counter(
            &mut out,
            "pulse_push_messages_sent_total",
            "Frames delivered to push connections",
            &self.push_messages_sent_total,
        );
        render_counter(
            &mut out,
            "pulse_push_send_failures_total",
            "Frames that failed delivery to push connections",
            &self.push_send_failures_total,
        );

        render_gauge(
            &mut out,
            "pulse_connections_open",
            "Live push connections",
            self.connections_open.get() as f64,
        );
        render_gauge(
            &mut out,
            "pulse_outbox_lag_seconds",
            "Age of the oldest unprocessed outbox row",
            self.outbox_lag_seconds.get(),
        );

        render_labeled_gauge(
            &mut out,
            "pulse_dlq_depth",
            "Entries on the dead-letter stream",
            "topic",
            &self.dlq_depth,
        );
        render_labeled_gauge(
            &mut out,
            "pulse_stream_consumer_lag",
            "Pending entries per tenant consumer group",
            "tenant",
            &self.stream_consumer_lag,
        );
        render_labeled_gauge(
            &mut out,
            "pulse_circuit_state",
            "Circuit breaker state (0 closed, 1 open, 2 half-open)",
            "name",
            &self.circuit_state,
        );

        render_histogram(
            &mut out,
            "pulse_bus_append_duration_seconds",
            "Latency of stream bus appends",
            &self.bus_append_duration_seconds,
        );
        render_histogram(
            &mut out,
            "pulse_push_queue_depth",
            "Outbound queue depth sampled at enqueue",
            &self.push_queue_depth,
        );

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, counter: &Counter) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
        counter.get()
    ));
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: f64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
    ));
}

fn render_labeled_gauge(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    gauge: &LabeledGauge,
) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n"));
    for (key, value) in gauge.snapshot() {
        out.push_str(&format!("{name}{{{label}=\"{key}\"}} {value}\n"));
    }
}

fn render_histogram(out: &mut String, name: &str, help: &str, histogram: &Histogram) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} histogram\n"));
    for (bound, count) in histogram.buckets.iter().zip(&histogram.counts) {
        out.push_str(&format!(
            "{name}_bucket{{le=\"{bound}\"}} {}\n",
            count.load(Ordering::Relaxed)
        ));
    }
    out.push_str(&format!(
        "{name}_bucket{{le=\"+Inf\"}} {}\n{name}_sum {}\n{name}_count {}\n",
        histogram.count(),
        histogram.sum(),
        histogram.count()
    ));
}
