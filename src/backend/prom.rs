// Prometheus metrics backend
// Registers one metric family per measured dimension under a namespace taken
// from the configured category, and hands out labeled children per operation

use super::{Counter, Gauge, Histogram, Meter, MetricKey, MetricKind, MetricsBackend, Timer};
use crate::errors::{InstrumentError, Result};
use ::prometheus::core::{MetricVec, MetricVecBuilder};
use ::prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const LABELS: [&str; 4] = ["action_type", "controller", "action", "instance"];

static DURATION_BUCKETS: Lazy<Vec<f64>> = Lazy::new(|| ::prometheus::DEFAULT_BUCKETS.to_vec());

static SIZE_BUCKETS: Lazy<Vec<f64>> = Lazy::new(|| {
    // 64 B .. 16 MiB
    exponential_buckets(64.0, 4.0, 10).unwrap_or_else(|_| vec![1024.0, 65536.0, 1048576.0])
});

struct Families {
    active: IntGaugeVec,
    calls: IntCounterVec,
    errors: IntCounterVec,
    duration: HistogramVec,
    last_call: IntGaugeVec,
    size: HistogramVec,
}

pub struct PrometheusBackend {
    namespace: String,
    registry: Registry,
    families: Families,
}

impl PrometheusBackend {
    pub fn new(category: &str) -> Result<Self> {
        Self::with_registry(category, Registry::new())
    }

    pub fn with_registry(category: &str, registry: Registry) -> Result<Self> {
        let namespace = metric_namespace(category);
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(namespace.clone());

        let families = Families {
            active: IntGaugeVec::new(opts("active_requests", "requests currently executing"), &LABELS)?,
            calls: IntCounterVec::new(opts("calls_total", "completed calls"), &LABELS)?,
            errors: IntCounterVec::new(opts("errors_total", "calls that ended in an unhandled failure"), &LABELS)?,
            duration: HistogramVec::new(
                HistogramOpts::new("request_duration_seconds", "call latency")
                    .namespace(namespace.clone())
                    .buckets(DURATION_BUCKETS.clone()),
                &LABELS,
            )?,
            last_call: IntGaugeVec::new(
                opts("last_call_elapsed_milliseconds", "latency of the most recent call"),
                &LABELS,
            )?,
            size: HistogramVec::new(
                HistogramOpts::new("request_size_bytes", "POST and PUT request body sizes")
                    .namespace(namespace.clone())
                    .buckets(SIZE_BUCKETS.clone()),
                &LABELS,
            )?,
        };

        registry.register(Box::new(families.active.clone()))?;
        registry.register(Box::new(families.calls.clone()))?;
        registry.register(Box::new(families.errors.clone()))?;
        registry.register(Box::new(families.duration.clone()))?;
        registry.register(Box::new(families.last_call.clone()))?;
        registry.register(Box::new(families.size.clone()))?;

        Ok(Self {
            namespace,
            registry,
            families,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of everything in the registry.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|err| InstrumentError::Backend(err.to_string()))
    }
}

impl MetricsBackend for PrometheusBackend {
    fn counter(&self, key: &MetricKey) -> Result<Arc<dyn Counter>> {
        match key.kind {
            MetricKind::ActiveRequests => {
                let (gauge, release) = labeled(&self.families.active, key);
                Ok(Arc::new(PromCounter { gauge, release }))
            }
            other => Err(unsupported("counter", other)),
        }
    }

    fn timer(&self, key: &MetricKey) -> Result<Arc<dyn Timer>> {
        match key.kind {
            MetricKind::CallDuration => {
                let (histogram, release) = labeled(&self.families.duration, key);
                Ok(Arc::new(PromTimer { histogram, release }))
            }
            other => Err(unsupported("timer", other)),
        }
    }

    fn meter(&self, key: &MetricKey) -> Result<Arc<dyn Meter>> {
        let family = match key.kind {
            MetricKind::DeltaCalls => &self.families.calls,
            MetricKind::Errors => &self.families.errors,
            other => return Err(unsupported("meter", other)),
        };
        let (counter, release) = labeled(family, key);
        Ok(Arc::new(PromMeter { counter, release }))
    }

    fn histogram(&self, key: &MetricKey) -> Result<Arc<dyn Histogram>> {
        match key.kind {
            MetricKind::RequestSize => {
                let (histogram, release) = labeled(&self.families.size, key);
                Ok(Arc::new(PromHistogram { histogram, release }))
            }
            other => Err(unsupported("histogram", other)),
        }
    }

    fn gauge(&self, key: &MetricKey) -> Result<Arc<dyn Gauge>> {
        match key.kind {
            MetricKind::LastCallElapsed => {
                let (gauge, release) = labeled(&self.families.last_call, key);
                Ok(Arc::new(PromGauge { gauge, release }))
            }
            other => Err(unsupported("gauge", other)),
        }
    }
}

/// Lowercase, `[a-z0-9_]` only, never starting with a digit.
pub fn metric_namespace(category: &str) -> String {
    let mut namespace: String = category
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if namespace.is_empty() {
        namespace.push_str("actions");
    } else if namespace.starts_with(|c: char| c.is_ascii_digit()) {
        namespace.insert(0, '_');
    }
    namespace
}

fn unsupported(instrument: &str, kind: MetricKind) -> InstrumentError {
    InstrumentError::Backend(format!("no {instrument} family for metric kind {kind}"))
}

type Releaser = Box<dyn Fn() + Send + Sync>;

fn labeled<T>(family: &MetricVec<T>, key: &MetricKey) -> (T::M, Releaser)
where
    T: MetricVecBuilder + 'static,
{
    let values = [
        key.category.clone(),
        key.group.clone(),
        key.member.clone(),
        key.instance.clone(),
    ];
    let refs: Vec<&str> = values.iter().map(String::as_str).collect();
    let child = family.with_label_values(&refs);

    let family = family.clone();
    let release: Releaser = Box::new(move || {
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        if let Err(err) = family.remove_label_values(&refs) {
            debug!(error = %err, instance = %values[3], "instrument already released");
        }
    });
    (child, release)
}

struct PromCounter {
    gauge: IntGauge,
    release: Releaser,
}

impl Counter for PromCounter {
    fn increment(&self) {
        self.gauge.inc();
    }

    fn decrement(&self) {
        self.gauge.dec();
    }

    fn release(&self) {
        (self.release)();
    }
}

struct PromTimer {
    histogram: ::prometheus::Histogram,
    release: Releaser,
}

impl Timer for PromTimer {
    fn record(&self, elapsed: Duration) {
        self.histogram.observe(elapsed.as_secs_f64());
    }

    fn release(&self) {
        (self.release)();
    }
}

struct PromMeter {
    counter: IntCounter,
    release: Releaser,
}

impl Meter for PromMeter {
    fn mark(&self) {
        self.counter.inc();
    }

    fn release(&self) {
        (self.release)();
    }
}

struct PromHistogram {
    histogram: ::prometheus::Histogram,
    release: Releaser,
}

impl Histogram for PromHistogram {
    fn update(&self, value: u64) {
        self.histogram.observe(value as f64);
    }

    fn release(&self) {
        (self.release)();
    }
}

struct PromGauge {
    gauge: IntGauge,
    release: Releaser,
}

impl Gauge for PromGauge {
    fn set(&self, value: i64) {
        self.gauge.set(value);
    }

    fn release(&self) {
        (self.release)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: MetricKind) -> MetricKey {
        MetricKey {
            category: "MVC".into(),
            group: "Store".into(),
            member: "Browse".into(),
            instance: "[1]-MVC Store.Browse[genre] GET".into(),
            kind,
        }
    }

    fn instance_series(backend: &PrometheusBackend, family: &str) -> usize {
        backend
            .registry()
            .gather()
            .iter()
            .filter(|mf| mf.get_name() == family)
            .map(|mf| mf.get_metric().len())
            .sum()
    }

    #[test]
    fn namespace_is_sanitized() {
        assert_eq!(metric_namespace("MusicStore"), "musicstore");
        assert_eq!(metric_namespace("Music Store-Perf"), "music_store_perf");
        assert_eq!(metric_namespace("9lives"), "_9lives");
        assert_eq!(metric_namespace("  "), "actions");
    }

    #[test]
    fn counter_moves_both_ways() {
        let backend = PrometheusBackend::new("Shop").expect("backend");
        let counter = backend.counter(&key(MetricKind::ActiveRequests)).expect("counter");
        counter.increment();
        counter.increment();
        counter.decrement();

        let refs: Vec<&str> = vec!["MVC", "Store", "Browse", "[1]-MVC Store.Browse[genre] GET"];
        assert_eq!(backend.families.active.with_label_values(&refs).get(), 1);
    }

    #[test]
    fn meters_route_to_their_families() {
        let backend = PrometheusBackend::new("Shop").expect("backend");
        backend.meter(&key(MetricKind::DeltaCalls)).expect("calls").mark();
        let errors = backend.meter(&key(MetricKind::Errors)).expect("errors");
        errors.mark();
        errors.mark();

        let refs: Vec<&str> = vec!["MVC", "Store", "Browse", "[1]-MVC Store.Browse[genre] GET"];
        assert_eq!(backend.families.calls.with_label_values(&refs).get(), 1);
        assert_eq!(backend.families.errors.with_label_values(&refs).get(), 2);
    }

    #[test]
    fn mismatched_kind_is_rejected() {
        let backend = PrometheusBackend::new("Shop").expect("backend");
        assert!(matches!(
            backend.counter(&key(MetricKind::Errors)),
            Err(InstrumentError::Backend(_))
        ));
        assert!(backend.gauge(&key(MetricKind::DeltaCalls)).is_err());
    }

    #[test]
    fn release_removes_label_set() {
        let backend = PrometheusBackend::new("Shop").expect("backend");
        let gauge = backend.gauge(&key(MetricKind::LastCallElapsed)).expect("gauge");
        gauge.set(17);
        assert_eq!(instance_series(&backend, "shop_last_call_elapsed_milliseconds"), 1);

        gauge.release();
        assert_eq!(instance_series(&backend, "shop_last_call_elapsed_milliseconds"), 0);
        // second release is harmless
        gauge.release();
    }

    #[test]
    fn render_exposes_namespaced_families() {
        let backend = PrometheusBackend::new("MusicStore").expect("backend");
        backend
            .timer(&key(MetricKind::CallDuration))
            .expect("timer")
            .record(Duration::from_millis(12));
        backend
            .histogram(&key(MetricKind::RequestSize))
            .expect("histogram")
            .update(2048);

        let text = backend.render().expect("render");
        assert!(text.contains("musicstore_request_duration_seconds_count"));
        assert!(text.contains("musicstore_request_size_bytes_sum"));
        assert!(text.contains("controller=\"Store\""));
    }
}
