//! In-process metrics with text exposition.
//!
//! Series are keyed by `name#k="v",...` with labels sorted, so the same
//! label set always lands on the same series. Counters and gauges are
//! scalar; histograms and timings retain a capped sample window and are
//! exposed as summaries with p50/p95/p99.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Samples retained per summary series. Oldest are dropped first.
const MAX_SAMPLES: usize = 1_000;

const QUANTILES: [(f64, &str); 3] = [(0.5, "0.5"), (0.95, "0.95"), (0.99, "0.99")];

pub type Labels<'a> = &'a [(&'a str, &'a str)];

#[derive(Debug, Default, Clone)]
struct Summary {
    count: u64,
    sum: f64,
    samples: Vec<f64>,
}

impl Summary {
    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.samples.len() >= MAX_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Nearest-rank quantile over the retained window.
    fn quantile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((q * sorted.len() as f64).ceil() as usize).max(1) - 1;
        sorted[rank.min(sorted.len() - 1)]
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Summary>,
    timings: HashMap<String, Summary>,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    state: RwLock<MetricsState>,
}

/// Series key: `name` alone, or `name#k="v",...` with labels sorted.
fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let sorted: BTreeMap<&str, &str> = labels.iter().copied().collect();
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{name}#{}", rendered.join(","))
}

/// Split a series key back into `name` and a braced label block.
fn render_series(key: &str) -> (&str, String) {
    match key.split_once('#') {
        Some((name, labels)) => (name, format!("{{{labels}}}")),
        None => (key, String::new()),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: Labels<'_>, delta: u64) {
        let key = series_key(name, labels);
        let mut state = self.state.write().unwrap();
        *state.counters.entry(key).or_insert(0) += delta;
    }

    pub fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        let key = series_key(name, labels);
        self.state.write().unwrap().gauges.insert(key, value);
    }

    pub fn observe_histogram(&self, name: &str, labels: Labels<'_>, value: f64) {
        let key = series_key(name, labels);
        let mut state = self.state.write().unwrap();
        state.histograms.entry(key).or_default().observe(value);
    }

    /// Record one operation duration in milliseconds.
    pub fn record_timing(&self, name: &str, labels: Labels<'_>, millis: f64) {
        let key = series_key(name, labels);
        let mut state = self.state.write().unwrap();
        state.timings.entry(key).or_default().observe(millis);
    }

    pub fn counter_value(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = series_key(name, labels);
        self.state
            .read()
            .unwrap()
            .counters
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let key = series_key(name, labels);
        self.state.read().unwrap().gauges.get(&key).copied()
    }

    pub fn reset(&self) {
        let mut state = self.state.write().unwrap();
        *state = MetricsState::default();
    }

    /// Render every series as exposition text. Series are grouped by
    /// type and emitted in sorted key order so output is deterministic.
    pub fn export(&self) -> String {
        let state = self.state.read().unwrap();
        let ts = now_ms();
        let mut out = String::new();

        let counters: BTreeMap<_, _> = state.counters.iter().collect();
        for (key, value) in counters {
            let (name, labels) = render_series(key);
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name}{labels} {value} {ts}\n"));
        }

        let gauges: BTreeMap<_, _> = state.gauges.iter().collect();
        for (key, value) in gauges {
            let (name, labels) = render_series(key);
            out.push_str(&format!("# TYPE {name} gauge\n"));
            out.push_str(&format!("{name}{labels} {value} {ts}\n"));
        }

        let summaries = state.histograms.iter().chain(state.timings.iter());
        let summaries: BTreeMap<_, _> = summaries.collect();
        for (key, summary) in summaries {
            let (name, labels) = render_series(key);
            out.push_str(&format!("# TYPE {name} summary\n"));
            out.push_str(&format!("{name}_count{labels} {} {ts}\n", summary.count));
            out.push_str(&format!("{name}_sum{labels} {} {ts}\n", summary.sum));
            for (q, tag) in QUANTILES {
                let line_labels = match key.split_once('#') {
                    Some((_, raw)) => format!("{{{raw},quantile=\"{tag}\"}}"),
                    None => format!("{{quantile=\"{tag}\"}}"),
                };
                out.push_str(&format!("{name}{line_labels} {} {ts}\n", summary.quantile(q)));
            }
        }

        out
    }
}
