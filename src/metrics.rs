//! Latency summaries for the upstream-bound paths (dictionary, enrichment,
//! batch fills). Each metric keeps a sliding window of recent samples.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

pub mod metric_names {
    pub const SLANG_FETCH: &str = "slang_fetch";
    pub const DICTIONARY_LOOKUP: &str = "dictionary_lookup";
    pub const ENRICH: &str = "enrich";
    pub const FILL_BATCH: &str = "fill_batch";
    pub const INITIALIZE_FIRST_ENTRY: &str = "initialize_first_entry";
}

const DEFAULT_WINDOW: usize = 1024;

/// Started by `MetricsRegistry::span`; `finish` records milliseconds.
pub struct TimingSpan {
    metric: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn finish(self) -> f64 {
        let ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.registry.record(self.metric, ms);
        ms
    }
}

/// Most recent samples of one metric plus a lifetime counter.
struct LatencyWindow {
    recent: VecDeque<f64>,
    limit: usize,
    seen: u64,
}

impl LatencyWindow {
    fn new(limit: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(limit.min(64)),
            limit,
            seen: 0,
        }
    }

    fn push(&mut self, ms: f64) {
        if self.recent.len() == self.limit {
            self.recent.pop_front();
        }
        self.recent.push_back(ms);
        self.seen += 1;
    }

    fn summarize(&self) -> MetricSummary {
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let rank = |p: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        MetricSummary {
            p50_ms: rank(50.0),
            p95_ms: rank(95.0),
            p99_ms: rank(99.0),
            max_ms: sorted.last().copied().unwrap_or(0.0),
            count: self.seen,
        }
    }
}

pub struct MetricsRegistry {
    windows: Mutex<HashMap<&'static str, LatencyWindow>>,
    window: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_ring_capacity(DEFAULT_WINDOW)
    }

    pub fn with_ring_capacity(window: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window: window.max(1),
        }
    }

    pub fn record(&self, metric: &'static str, ms: f64) {
        let window = self.window;
        self.windows
            .lock()
            .entry(metric)
            .or_insert_with(|| LatencyWindow::new(window))
            .push(ms);
        tracing::trace!(metric, ms, "latency recorded");
    }

    pub fn span(self: &Arc<Self>, metric: &'static str) -> TimingSpan {
        TimingSpan {
            metric,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Per-metric summaries, keyed and ordered by metric name.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        let windows = self.windows.lock();
        windows
            .iter()
            .map(|(metric, window)| (metric.to_string(), window.summarize()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    /// Every sample ever recorded, not just the ones still in the window.
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_recorded_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::ENRICH, v as f64);
        }
        let summary = registry.summary();
        let enrich = &summary[metric_names::ENRICH];
        assert_eq!(enrich.count, 100);
        assert_eq!(enrich.p50_ms, 51.0);
        assert_eq!(enrich.p99_ms, 99.0);
        assert_eq!(enrich.max_ms, 100.0);
    }

    #[test]
    fn window_keeps_latest_samples() {
        let registry = MetricsRegistry::with_ring_capacity(2);
        for v in [100.0, 1.0, 2.0] {
            registry.record(metric_names::FILL_BATCH, v);
        }
        let summary = registry.summary();
        let fill = &summary[metric_names::FILL_BATCH];
        assert_eq!(fill.count, 3);
        assert_eq!(fill.max_ms, 2.0);
    }

    #[test]
    fn span_records_on_finish() {
        let registry = Arc::new(MetricsRegistry::new());
        let ms = registry.span(metric_names::SLANG_FETCH).finish();
        assert!(ms >= 0.0);
        assert_eq!(registry.summary()[metric_names::SLANG_FETCH].count, 1);
    }
}
