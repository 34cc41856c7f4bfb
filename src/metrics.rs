//! Metrics sink and Prometheus exposition.
//!
//! Middleware and handlers record through the [`Metrics`] trait, keyed by
//! `(subsystem, name)` plus an optional label set. [`PrometheusMetrics`] is
//! the production sink: it owns a private
//! [`PrometheusRecorder`](metrics_exporter_prometheus::PrometheusRecorder)
//! instead of installing the process-global recorder, so several services
//! (or tests) can live in one process without sharing state.
//!
//! # Naming
//!
//! The exported name is `{namespace}_{subsystem}_{name}`, lowercased, with
//! empty parts skipped. Observations whose name ends in `_seconds` or
//! `_milliseconds` render as Prometheus histograms; every other observation
//! renders as a summary.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{Key, KeyName, Label, Level, Metadata, Recorder, SharedString};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tracing::warn;

use crate::error::Error;

/// Bucket boundaries for `*_seconds` histograms.
const SECONDS_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Bucket boundaries for `*_milliseconds` histograms.
const MILLISECONDS_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];

/// Ordered `(label, value)` pairs attached to one observation.
pub type Labels = Vec<(&'static str, String)>;

/// The metrics capability consumed by middleware and handlers.
///
/// Implementations must tolerate concurrent calls from any number of
/// requests, and repeated registrations of the same name must resolve to the
/// same instrument.
pub trait Metrics: Send + Sync + 'static {
    /// Increments an unlabelled counter by one.
    fn count(&self, subsystem: &str, name: &str, help: &str);

    /// Increments a labelled counter by one.
    fn count_labels(&self, subsystem: &str, name: &str, help: &str, labels: &Labels);

    /// Increments an unlabelled counter by `increment`.
    fn increase_counter(&self, subsystem: &str, name: &str, help: &str, increment: u64);

    fn set_gauge(&self, value: f64, subsystem: &str, name: &str, help: &str);

    /// Records one observation into a histogram.
    fn observe_histogram(&self, subsystem: &str, name: &str, help: &str, labels: &Labels, value: f64);

    /// Records one observation into a summary.
    fn observe_summary(&self, subsystem: &str, name: &str, help: &str, labels: &Labels, value: f64);

    /// Renders the exposition payload served by the metrics endpoint.
    fn render(&self) -> String;
}

/// Converts an elapsed duration into `unit`-sized steps, e.g. milliseconds.
pub fn duration_in(elapsed: Duration, unit: Duration) -> f64 {
    elapsed.as_secs_f64() / unit.as_secs_f64()
}

// ── NoopMetrics ───────────────────────────────────────────────────────────────

/// A sink that drops everything. Used for requests built outside a router.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn count(&self, _: &str, _: &str, _: &str) {}
    fn count_labels(&self, _: &str, _: &str, _: &str, _: &Labels) {}
    fn increase_counter(&self, _: &str, _: &str, _: &str, _: u64) {}
    fn set_gauge(&self, _: f64, _: &str, _: &str, _: &str) {}
    fn observe_histogram(&self, _: &str, _: &str, _: &str, _: &Labels, _: f64) {}
    fn observe_summary(&self, _: &str, _: &str, _: &str, _: &Labels, _: f64) {}
    fn render(&self) -> String { String::new() }
}

// ── PrometheusMetrics ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

/// [`Metrics`] backed by a privately owned Prometheus recorder.
pub struct PrometheusMetrics {
    namespace: String,
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    kinds: DashMap<String, Kind>,
}

impl PrometheusMetrics {
    /// Creates a sink whose metric names are prefixed with `namespace`.
    pub fn new(namespace: &str) -> Result<Self, Error> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("_seconds".to_owned()), SECONDS_BUCKETS)?
            .set_buckets_for_metric(Matcher::Suffix("_milliseconds".to_owned()), MILLISECONDS_BUCKETS)?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self {
            namespace: sanitize(namespace),
            recorder,
            handle,
            kinds: DashMap::new(),
        })
    }

    fn full_name(&self, subsystem: &str, name: &str) -> String {
        [self.namespace.as_str(), &sanitize(subsystem), &sanitize(name)]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Claims `name` for `kind`; first claim wins, later conflicting claims
    /// are reported and skipped.
    fn claim(&self, name: &str, kind: Kind, help: &str) -> bool {
        match self.kinds.entry(name.to_owned()) {
            Entry::Occupied(e) if *e.get() != kind => {
                warn!(
                    metric = name,
                    registered = ?e.get(),
                    requested = ?kind,
                    "metric already registered with another kind, keeping the existing one"
                );
                false
            }
            Entry::Occupied(_) => true,
            Entry::Vacant(v) => {
                v.insert(kind);
                let key = KeyName::from(name.to_owned());
                let help = SharedString::from(help.to_owned());
                match kind {
                    Kind::Counter => self.recorder.describe_counter(key, None, help),
                    Kind::Gauge => self.recorder.describe_gauge(key, None, help),
                    Kind::Histogram | Kind::Summary => self.recorder.describe_histogram(key, None, help),
                }
                true
            }
        }
    }

    fn increment(&self, subsystem: &str, name: &str, help: &str, labels: &Labels, by: u64) {
        let full = self.full_name(subsystem, name);
        if self.claim(&full, Kind::Counter, help) {
            self.recorder.register_counter(&key(full, labels), &metadata()).increment(by);
        }
    }

    fn observe(&self, kind: Kind, subsystem: &str, name: &str, help: &str, labels: &Labels, value: f64) {
        let full = self.full_name(subsystem, name);
        if self.claim(&full, kind, help) {
            self.recorder.register_histogram(&key(full, labels), &metadata()).record(value);
        }
    }
}

impl Metrics for PrometheusMetrics {
    fn count(&self, subsystem: &str, name: &str, help: &str) {
        self.increment(subsystem, name, help, &Labels::new(), 1);
    }

    fn count_labels(&self, subsystem: &str, name: &str, help: &str, labels: &Labels) {
        self.increment(subsystem, name, help, labels, 1);
    }

    fn increase_counter(&self, subsystem: &str, name: &str, help: &str, increment: u64) {
        self.increment(subsystem, name, help, &Labels::new(), increment);
    }

    fn set_gauge(&self, value: f64, subsystem: &str, name: &str, help: &str) {
        let full = self.full_name(subsystem, name);
        if self.claim(&full, Kind::Gauge, help) {
            self.recorder.register_gauge(&key(full, &Labels::new()), &metadata()).set(value);
        }
    }

    fn observe_histogram(&self, subsystem: &str, name: &str, help: &str, labels: &Labels, value: f64) {
        self.observe(Kind::Histogram, subsystem, name, help, labels, value);
    }

    fn observe_summary(&self, subsystem: &str, name: &str, help: &str, labels: &Labels, value: f64) {
        self.observe(Kind::Summary, subsystem, name, help, labels, value);
    }

    fn render(&self) -> String {
        self.handle.render()
    }
}

fn key(name: String, labels: &Labels) -> Key {
    let labels: Vec<Label> = labels
        .iter()
        .map(|(k, v)| Label::new(*k, v.clone()))
        .collect();
    Key::from_parts(name, labels)
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// Lowercases and replaces anything outside `[a-z0-9_]` with `_`.
fn sanitize(part: &str) -> String {
    part.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(status: &str) -> Labels {
        vec![("status", status.to_owned()), ("method", "get".to_owned())]
    }

    #[test]
    fn names_skip_empty_parts() {
        let m = PrometheusMetrics::new("Orders API").unwrap();
        assert_eq!(m.full_name("", "do_total"), "orders_api_do_total");
        assert_eq!(m.full_name("public", "do_total"), "orders_api_public_do_total");
    }

    #[test]
    fn labelled_counter_renders_with_labels() {
        let m = PrometheusMetrics::new("app").unwrap();
        m.count_labels("public", "do_total", "Totals for do.", &labels("404"));
        m.count_labels("public", "do_total", "Totals for do.", &labels("404"));
        let out = m.render();
        assert!(out.contains("app_public_do_total"), "{out}");
        assert!(out.contains(r#"status="404""#), "{out}");
        assert!(out.contains("} 2"), "{out}");
    }

    #[test]
    fn conflicting_registration_keeps_first_kind() {
        let m = PrometheusMetrics::new("app").unwrap();
        m.count("", "requests", "Requests.");
        m.set_gauge(5.0, "", "requests", "Requests.");
        assert_eq!(*m.kinds.get("app_requests").unwrap(), Kind::Counter);
        let out = m.render();
        assert!(out.contains("app_requests 1"), "{out}");
    }

    #[test]
    fn seconds_observations_render_as_histogram() {
        let m = PrometheusMetrics::new("app").unwrap();
        m.observe_histogram("", "http_request_duration_seconds", "Durations.", &labels("200"), 0.02);
        let out = m.render();
        assert!(out.contains("app_http_request_duration_seconds_bucket"), "{out}");
    }

    #[test]
    fn duration_conversion() {
        let d = Duration::from_millis(1500);
        assert_eq!(duration_in(d, Duration::from_secs(1)), 1.5);
        assert_eq!(duration_in(d, Duration::from_millis(1)), 1500.0);
    }
}
