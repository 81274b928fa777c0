//! Observability: latency histograms, timing spans and token accounting.
//! Histograms track p50/p95/p99 for every named timing point.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

/// A span measuring elapsed time from creation to explicit end.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn new(name: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            name,
            start: Instant::now(),
            registry,
        }
    }

    /// End the span, recording elapsed duration in microseconds.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }
}

/// Most recent samples for one metric; the oldest is evicted once full.
struct SampleRing {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    /// Nearest-rank percentiles (0-100) over one sorted copy.
    fn percentiles<const N: usize>(&self, ps: [f64; N]) -> [f64; N] {
        let mut out = [0.0; N];
        if self.samples.is_empty() {
            return out;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let last = sorted.len() - 1;
        for (slot, p) in out.iter_mut().zip(ps) {
            let rank = ((p / 100.0) * last as f64).round() as usize;
            *slot = sorted[rank.min(last)];
        }
        out
    }
}

/// Stores histograms for all named metrics plus counters.
pub struct MetricsRegistry {
    histograms: Mutex<BTreeMap<&'static str, SampleRing>>,
    ring_capacity: usize,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
    retries: AtomicU64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            histograms: Mutex::new(BTreeMap::new()),
            ring_capacity: ring_capacity.max(1),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Record a sample (in microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    /// Start a timing span that records on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Get percentile for a metric (p value 0-100). Returns microseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map(|ring| ring.percentiles([p])[0])
            .unwrap_or(0.0)
    }

    pub fn add_usage(&self, usage: crate::translate::Usage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
        self.completion_tokens.fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens as u64, Ordering::Relaxed);
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Summary of all metrics at p50/p95/p99, sorted by name.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        let hists = self.histograms.lock();
        hists
            .iter()
            .map(|(&name, ring)| {
                let [p50_us, p95_us, p99_us] = ring.percentiles([50.0, 95.0, 99.0]);
                let summary = MetricSummary { p50_us, p95_us, p99_us, count: ring.len() };
                (name.to_string(), summary)
            })
            .collect()
    }

    /// Emit one info line per histogram plus the token totals.
    pub fn log_summary(&self) {
        for (name, s) in self.summary() {
            info!(
                metric = %name,
                count = s.count,
                p50_ms = s.p50_us / 1000.0,
                p95_ms = s.p95_us / 1000.0,
                p99_ms = s.p99_us / 1000.0,
                "metric_summary"
            );
        }
        info!(
            prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens = self.completion_tokens.load(Ordering::Relaxed),
            total_tokens = self.total_tokens(),
            retries = self.retries(),
            "usage_summary"
        );
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Well-known metric names (constants to avoid typos).
pub mod metric_names {
    /// Enqueue to worker pickup.
    pub const QUEUE_WAIT: &str = "queue_wait";
    /// One dispatch attempt, glossary through translate.
    pub const DISPATCH_DONE: &str = "t_dispatch_done";
    /// Whole job including retries and backoff.
    pub const JOB_DONE: &str = "t_job_done";
}
