//! In-process metrics registry
//!
//! Counters, gauges and latency histograms keyed by name plus label set,
//! rendered in Prometheus text format (version 0.0.4) for `GET /metrics`.
//! One registry is created at startup and shared by `Arc` with every
//! component that emits.
//!
//! Exposed series (all prefixed `stagewarden_`):
//! - `audit_events_total{kind}`         every audit append
//! - `stage_outcomes_total{stage,outcome}`
//! - `stage_latency_seconds{stage}`     histogram of completed stage calls
//! - `end_to_end_latency_seconds`       histogram of clip runs
//! - `slo_breach_total{stage}`          watchdog firings
//! - `watchdog_timers_in_flight`        armed watchdog timers
//! - `late_results_discarded_total{stage}`
//! - `degradations_total{reason}`
//! - `dispatch_attempts_total{outcome}`, `dispatch_retries_total`
//! - `clips_total{state}`, `clips_rejected_total`, `intake_queue_depth`
//! - `escalations_total{rule,result}`
//! - `fault_active{scenario,component}`
//! - `uptime_seconds`                 seconds since the registry was created

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::defaults::{LATENCY_BUCKETS_SECS, METRICS_PREFIX};

type Labels = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Labels,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Labels = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn render_labels(&self, extra: Option<(&str, String)>) -> String {
        let mut parts: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
            .collect();
        if let Some((k, v)) = extra {
            parts.push(format!("{k}=\"{v}\""));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[derive(Debug, Clone)]
struct Histogram {
    /// Cumulative counts per bucket bound
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: vec![0; LATENCY_BUCKETS_SECS.len()],
            count: 0,
            sum: 0.0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (bound, slot) in LATENCY_BUCKETS_SECS.iter().zip(self.buckets.iter_mut()) {
            if value <= *bound {
                *slot += 1;
            }
        }
        self.count += 1;
        self.sum += value;
    }
}

#[derive(Debug, Default)]
struct Registry {
    counters: BTreeMap<SeriesKey, u64>,
    gauges: BTreeMap<SeriesKey, f64>,
    histograms: BTreeMap<SeriesKey, Histogram>,
}

// ============================================================================
// Metrics
// ============================================================================

/// Shared metrics registry.
#[derive(Debug)]
pub struct Metrics {
    inner: Mutex<Registry>,
    started: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            started: Instant::now(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whole seconds since startup.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        // a poisoned registry still holds valid numbers
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn incr(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(name, labels, 1);
    }

    pub fn add(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = SeriesKey::new(name, labels);
        self.with(|r| *r.counters.entry(key).or_insert(0) += n);
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        self.with(|r| {
            r.gauges.insert(key, value);
        });
    }

    /// Record one latency sample in seconds.
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], seconds: f64) {
        let key = SeriesKey::new(name, labels);
        self.with(|r| r.histograms.entry(key).or_insert_with(Histogram::new).observe(seconds));
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = SeriesKey::new(name, labels);
        self.with(|r| r.counters.get(&key).copied().unwrap_or(0))
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = SeriesKey::new(name, labels);
        self.with(|r| r.gauges.get(&key).copied())
    }

    /// Number of samples recorded in a histogram.
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = SeriesKey::new(name, labels);
        self.with(|r| r.histograms.get(&key).map_or(0, |h| h.count))
    }

    /// Render every series in Prometheus text format.
    pub fn render(&self) -> String {
        self.with(|r| {
            let mut body = String::with_capacity(4096);
            let mut last_name = String::new();

            let _ = writeln!(body, "# HELP {METRICS_PREFIX}_uptime_seconds Process uptime in seconds");
            let _ = writeln!(body, "# TYPE {METRICS_PREFIX}_uptime_seconds gauge");
            let _ = writeln!(body, "{METRICS_PREFIX}_uptime_seconds {}", self.uptime_secs());

            for (key, value) in &r.counters {
                type_line(&mut body, &mut last_name, &key.name, "counter");
                let _ = writeln!(body, "{METRICS_PREFIX}_{}{} {value}", key.name, key.render_labels(None));
            }
            last_name.clear();
            for (key, value) in &r.gauges {
                type_line(&mut body, &mut last_name, &key.name, "gauge");
                let _ = writeln!(body, "{METRICS_PREFIX}_{}{} {value}", key.name, key.render_labels(None));
            }
            last_name.clear();
            for (key, h) in &r.histograms {
                type_line(&mut body, &mut last_name, &key.name, "histogram");
                for (bound, count) in LATENCY_BUCKETS_SECS.iter().zip(&h.buckets) {
                    let labels = key.render_labels(Some(("le", bound.to_string())));
                    let _ = writeln!(body, "{METRICS_PREFIX}_{}_bucket{labels} {count}", key.name);
                }
                let inf = key.render_labels(Some(("le", "+Inf".to_string())));
                let _ = writeln!(body, "{METRICS_PREFIX}_{}_bucket{inf} {}", key.name, h.count);
                let plain = key.render_labels(None);
                let _ = writeln!(body, "{METRICS_PREFIX}_{}_sum{plain} {}", key.name, h.sum);
                let _ = writeln!(body, "{METRICS_PREFIX}_{}_count{plain} {}", key.name, h.count);
            }
            body
        })
    }
}

fn type_line(body: &mut String, last: &mut String, name: &str, kind: &str) {
    if last != name {
        let _ = writeln!(body, "# TYPE {METRICS_PREFIX}_{name} {kind}");
        *last = name.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_labels_are_order_independent() {
        let m = Metrics::new();
        m.incr("stage_outcomes_total", &[("stage", "observer"), ("outcome", "ok")]);
        m.incr("stage_outcomes_total", &[("outcome", "ok"), ("stage", "observer")]);
        assert_eq!(
            m.counter("stage_outcomes_total", &[("stage", "observer"), ("outcome", "ok")]),
            2
        );
    }

    #[test]
    fn test_render_prometheus_text() {
        let m = Metrics::new();
        m.incr("audit_events_total", &[("kind", "stage_start")]);
        m.set_gauge("intake_queue_depth", &[], 3.0);
        m.observe("stage_latency_seconds", &[("stage", "doer")], 0.3);

        let body = m.render();
        assert!(body.contains("# TYPE stagewarden_audit_events_total counter"));
        assert!(body.contains("stagewarden_audit_events_total{kind=\"stage_start\"} 1"));
        assert!(body.contains("stagewarden_intake_queue_depth 3"));
        assert!(body.contains("stagewarden_stage_latency_seconds_bucket{stage=\"doer\",le=\"0.25\"} 0"));
        assert!(body.contains("stagewarden_stage_latency_seconds_bucket{stage=\"doer\",le=\"0.5\"} 1"));
        assert!(body.contains("stagewarden_stage_latency_seconds_count{stage=\"doer\"} 1"));
    }

    #[test]
    fn test_uptime_always_rendered() {
        let body = Metrics::new().render();
        assert!(body.contains("# TYPE stagewarden_uptime_seconds gauge"));
        assert!(body.contains("stagewarden_uptime_seconds 0"));
    }

    #[test]
    fn test_type_line_emitted_once_per_name() {
        let m = Metrics::new();
        m.incr("clips_total", &[("state", "dispatched")]);
        m.incr("clips_total", &[("state", "failed")]);
        let body = m.render();
        assert_eq!(body.matches("# TYPE stagewarden_clips_total counter").count(), 1);
    }
}
