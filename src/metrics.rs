//! Prometheus metrics plus an in-process, per-topic rollup.
//!
//! The Prometheus side (statics registered through `once_cell::Lazy`, scraped
//! over a tiny `hyper` server) exists for operators. The `MetricsCollector`
//! side exists for the engine itself: `Runner::status()` and the CLI's
//! `status` output need a cheap, copy-on-read snapshot of per-topic counters
//! without going through the text exposition format.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tracing::{error, info};

/// Which end of a `Flow` a topic metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    fn as_label(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "destination",
        }
    }
}

// ============================================
// PROMETHEUS DEFINITIONS
// ============================================

static MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flowbridge_messages_total",
        "Total number of messages seen per topic and side",
        &["topic", "side"]
    )
    .expect("failed to create messages_total metric")
});

static BYTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flowbridge_bytes_total",
        "Total payload bytes seen per topic and side",
        &["topic", "side"]
    )
    .expect("failed to create bytes_total metric")
});

static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flowbridge_errors_total",
        "Total number of per-message errors per topic and side",
        &["topic", "side"]
    )
    .expect("failed to create errors_total metric")
});

static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "flowbridge_queue_depth",
        "Number of messages waiting in a bounded queue",
        &["queue"]
    )
    .expect("failed to create queue_depth metric")
});

static QUEUE_CAPACITY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "flowbridge_queue_capacity",
        "Capacity of a bounded queue",
        &["queue"]
    )
    .expect("failed to create queue_capacity metric")
});

static ACTIVE_WORKERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "flowbridge_active_workers",
        "Number of worker-pool slots currently in use",
        &["pool"]
    )
    .expect("failed to create active_workers metric")
});

static BACKPRESSURE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flowbridge_backpressure_events_total",
        "Number of times a queue transitioned into back-pressure",
        &["queue"]
    )
    .expect("failed to create backpressure_events metric")
});

static PUBLISH_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];
    register_histogram_vec!(
        HistogramOpts::new(
            "flowbridge_publish_latency_seconds",
            "Latency of a single publish call to a destination adapter"
        )
        .buckets(buckets),
        &["topic"]
    )
    .expect("failed to create publish_latency metric")
});

/// Collects all registered metrics as Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

/// RAII timer recording a publish-latency observation on drop.
pub struct PublishTimer {
    topic: String,
    start: std::time::Instant,
}

impl PublishTimer {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for PublishTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        PUBLISH_LATENCY.with_label_values(&[&self.topic]).observe(elapsed);
    }
}

pub fn set_queue_depth(queue: &str, depth: i64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

pub fn set_queue_capacity(queue: &str, capacity: i64) {
    QUEUE_CAPACITY.with_label_values(&[queue]).set(capacity);
}

pub fn set_active_workers(pool: &str, count: i64) {
    ACTIVE_WORKERS.with_label_values(&[pool]).set(count);
}

pub fn record_backpressure(queue: &str) {
    BACKPRESSURE_EVENTS.with_label_values(&[queue]).inc();
}

// ============================================
// IN-PROCESS PER-TOPIC ROLLUP
// ============================================

struct TopicCounters {
    message_count: AtomicU64,
    total_bytes: AtomicU64,
    error_count: AtomicU64,
    last_message_epoch_ms: AtomicI64,
}

impl TopicCounters {
    fn new() -> Self {
        Self {
            message_count: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_message_epoch_ms: AtomicI64::new(0),
        }
    }
}

/// A point-in-time copy of a topic's counters, safe to hand to a CLI
/// formatter or a status RPC without holding any lock.
#[derive(Debug, Clone)]
pub struct TopicMetricsSnapshot {
    pub topic: String,
    pub side: Side,
    pub message_count: u64,
    pub total_bytes: u64,
    pub error_count: u64,
    pub last_message_time: Option<DateTime<Utc>>,
    pub rate_per_second: f64,
}

/// Tracks message/byte/error counts per `(topic, side)`, mirrored into the
/// Prometheus statics above and also kept in a plain map for cheap
/// `snapshot()` reads (the engine polls this every few seconds; Prometheus
/// counters can't be read back cheaply without re-parsing the registry).
pub struct MetricsCollector {
    counters: RwLock<HashMap<(String, Side), Arc<TopicCounters>>>,
    started_at: std::time::Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            started_at: std::time::Instant::now(),
        }
    }

    fn counters_for(&self, topic: &str, side: Side) -> Arc<TopicCounters> {
        if let Some(existing) = self.counters.read().get(&(topic.to_string(), side)) {
            return existing.clone();
        }
        let mut guard = self.counters.write();
        guard
            .entry((topic.to_string(), side))
            .or_insert_with(|| Arc::new(TopicCounters::new()))
            .clone()
    }

    pub fn record_message(&self, topic: &str, side: Side, bytes: usize) {
        let counters = self.counters_for(topic, side);
        counters.message_count.fetch_add(1, Ordering::Relaxed);
        counters.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        counters
            .last_message_epoch_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        MESSAGES_TOTAL.with_label_values(&[topic, side.as_label()]).inc();
        BYTES_TOTAL.with_label_values(&[topic, side.as_label()]).inc_by(bytes as u64);
    }

    pub fn record_error(&self, topic: &str, side: Side) {
        let counters = self.counters_for(topic, side);
        counters.error_count.fetch_add(1, Ordering::Relaxed);
        ERRORS_TOTAL.with_label_values(&[topic, side.as_label()]).inc();
    }

    /// A copy-on-read view of every topic this collector has seen.
    /// `rate_per_second` is the topic's lifetime average since the flow
    /// started, not a delta against the previous `snapshot()` call — a
    /// caller polling once a minute and one polling once a second see the
    /// same number at the same point in the flow's life.
    pub fn snapshot(&self) -> Vec<TopicMetricsSnapshot> {
        let counters = self.counters.read();
        let mut out = Vec::with_capacity(counters.len());
        let elapsed_seconds = self.started_at.elapsed().as_secs_f64().max(f64::EPSILON);

        for ((topic, side), counters) in counters.iter() {
            let message_count = counters.message_count.load(Ordering::Relaxed);
            let total_bytes = counters.total_bytes.load(Ordering::Relaxed);
            let error_count = counters.error_count.load(Ordering::Relaxed);
            let last_epoch_ms = counters.last_message_epoch_ms.load(Ordering::Relaxed);

            let last_message_time = if last_epoch_ms > 0 {
                DateTime::from_timestamp_millis(last_epoch_ms)
            } else {
                None
            };

            let rate_per_second = message_count as f64 / elapsed_seconds;

            out.push(TopicMetricsSnapshot {
                topic: topic.clone(),
                side: *side,
                message_count,
                total_bytes,
                error_count,
                last_message_time,
                rate_per_second,
            });
        }

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// METRICS SERVER
// ============================================

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn handle_metrics(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let metrics = gather_metrics();
    Ok(Response::new(Full::new(Bytes::from(metrics))))
}

/// Serves `/metrics` in Prometheus text format until the process exits.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "error serving metrics connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_snapshots_a_topic() {
        let collector = MetricsCollector::new();
        collector.record_message("orders", Side::Source, 128);
        collector.record_message("orders", Side::Source, 256);
        collector.record_error("orders", Side::Source);

        let snapshot = collector.snapshot();
        let orders = snapshot.iter().find(|s| s.topic == "orders").unwrap();

        assert_eq!(orders.message_count, 2);
        assert_eq!(orders.total_bytes, 384);
        assert_eq!(orders.error_count, 1);
        assert!(orders.last_message_time.is_some());
    }

    #[test]
    fn tracks_source_and_destination_independently() {
        let collector = MetricsCollector::new();
        collector.record_message("orders", Side::Source, 10);
        collector.record_message("orders", Side::Destination, 10);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn rate_per_second_is_relative_to_flow_start_not_the_previous_snapshot() {
        let collector = MetricsCollector::new();
        collector.record_message("orders", Side::Source, 10);

        let first = collector.snapshot();
        let first_rate = first.iter().find(|s| s.topic == "orders").unwrap().rate_per_second;
        assert!(first_rate > 0.0, "first snapshot should already report a nonzero rate");

        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = collector.snapshot();
        let second_rate = second.iter().find(|s| s.topic == "orders").unwrap().rate_per_second;
        assert!(second_rate < first_rate, "rate should fall as elapsed time grows with no new messages");
    }

    #[test]
    fn exposes_prometheus_text_format() {
        let collector = MetricsCollector::new();
        collector.record_message("metrics-test-topic", Side::Source, 8);

        let text = gather_metrics();
        assert!(text.contains("flowbridge_messages_total"));
    }
}
