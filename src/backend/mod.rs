// Metrics backend interface
// Collectors obtain named instruments from a backend once, when their bundle is
// created, and update them on every invocation afterwards.

pub mod prom;

pub use self::prom::PrometheusBackend;

use crate::errors::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Measured dimension an instrument belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    ActiveRequests,
    CallDuration,
    LastCallElapsed,
    DeltaCalls,
    Errors,
    RequestSize,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::ActiveRequests => "Active Requests",
            MetricKind::CallDuration => "Call Duration",
            MetricKind::LastCallElapsed => "Last Call Elapsed Time",
            MetricKind::DeltaCalls => "Delta Calls",
            MetricKind::Errors => "Errors",
            MetricKind::RequestSize => "Request Size",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of one instrument: group + member + kind, scoped under a category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub category: String,
    pub group: String,
    pub member: String,
    /// Sanitized identity of the operation the instrument belongs to.
    pub instance: String,
    pub kind: MetricKind,
}

impl MetricKey {
    pub fn display_name(&self) -> String {
        format!("{} {} {}", self.group, self.member, self.kind)
    }
}

/// Up/down counter.
pub trait Counter: Send + Sync {
    fn increment(&self);
    fn decrement(&self);
    fn release(&self) {}
}

pub trait Timer: Send + Sync {
    fn record(&self, elapsed: Duration);
    fn release(&self) {}
}

/// Monotonic event count; rates are derived by whoever reads it.
pub trait Meter: Send + Sync {
    fn mark(&self);
    fn release(&self) {}
}

pub trait Histogram: Send + Sync {
    fn update(&self, value: u64);
    fn release(&self) {}
}

/// Last-value gauge.
pub trait Gauge: Send + Sync {
    fn set(&self, value: i64);
    fn release(&self) {}
}

pub trait MetricsBackend: Send + Sync {
    fn counter(&self, key: &MetricKey) -> Result<Arc<dyn Counter>>;
    fn timer(&self, key: &MetricKey) -> Result<Arc<dyn Timer>>;
    fn meter(&self, key: &MetricKey) -> Result<Arc<dyn Meter>>;
    fn histogram(&self, key: &MetricKey) -> Result<Arc<dyn Histogram>>;
    fn gauge(&self, key: &MetricKey) -> Result<Arc<dyn Gauge>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_read_as_words() {
        let key = |kind| MetricKey {
            category: "Shop".into(),
            group: "Home".into(),
            member: "Index".into(),
            instance: "[1]-MVC Home.Index[] GET".into(),
            kind,
        };
        assert_eq!(key(MetricKind::ActiveRequests).display_name(), "Home Index Active Requests");
        assert_eq!(key(MetricKind::LastCallElapsed).display_name(), "Home Index Last Call Elapsed Time");
        assert_eq!(key(MetricKind::RequestSize).display_name(), "Home Index Request Size");
    }
}
