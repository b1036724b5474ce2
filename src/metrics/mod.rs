// Metric collectors
// Each collector measures one dimension of an operation and is bound to the
// backend instruments of a single operation identity.

pub mod failures;
pub mod payload;
pub mod requests;

pub use failures::ErrorRateMetric;
pub use payload::PayloadSizeMetric;
pub use requests::{ActiveRequestsMetric, CallTimerMetric, DeltaCallsMetric, LastCallElapsedMetric};

use crate::backend::{MetricKey, MetricKind, MetricsBackend};
use crate::errors::Result;
use crate::identity::{Invocation, OperationIdentity};
use std::sync::Arc;
use std::time::Duration;

/// One measurement behavior. Every hook defaults to a no-op, so a collector
/// implements only the phases it cares about.
pub trait Metric: Send + Sync {
    /// Short label used in logs.
    fn kind(&self) -> &str;

    fn on_start(&self, _invocation: &Invocation) -> Result<()> {
        Ok(())
    }

    fn on_complete(&self, _invocation: &Invocation, _elapsed: Duration, _failed: bool) -> Result<()> {
        Ok(())
    }

    /// Called once when the owning bundle is torn down.
    fn release(&self) {}
}

/// What a constructor gets to bind a new collector.
pub struct MetricScope<'a> {
    pub identity: &'a OperationIdentity,
    /// Sanitized identity.
    pub instance: &'a str,
    pub backend: &'a dyn MetricsBackend,
}

impl MetricScope<'_> {
    pub fn key(&self, kind: MetricKind) -> MetricKey {
        MetricKey {
            category: self.identity.category().to_string(),
            group: self.identity.group().to_string(),
            member: self.identity.member().to_string(),
            instance: self.instance.to_string(),
            kind,
        }
    }
}

pub type MetricConstructor =
    Arc<dyn Fn(&MetricScope<'_>) -> Result<Box<dyn Metric>> + Send + Sync>;

/// Wrap a closure as a constructor.
pub fn constructor<F>(f: F) -> MetricConstructor
where
    F: Fn(&MetricScope<'_>) -> Result<Box<dyn Metric>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The standard collector set, in bundle order.
pub fn builtin_constructors() -> Vec<MetricConstructor> {
    vec![
        constructor(|scope| Ok(Box::new(ActiveRequestsMetric::new(scope)?) as Box<dyn Metric>)),
        constructor(|scope| Ok(Box::new(CallTimerMetric::new(scope)?) as Box<dyn Metric>)),
        constructor(|scope| Ok(Box::new(LastCallElapsedMetric::new(scope)?) as Box<dyn Metric>)),
        constructor(|scope| Ok(Box::new(DeltaCallsMetric::new(scope)?) as Box<dyn Metric>)),
        constructor(|scope| Ok(Box::new(ErrorRateMetric::new(scope)?) as Box<dyn Metric>)),
        constructor(|scope| Ok(Box::new(PayloadSizeMetric::new(scope)?) as Box<dyn Metric>)),
    ]
}

/// `1000 * ticks / ticks_per_second`, rounded half to even.
pub fn ticks_to_millis(ticks: u64, ticks_per_second: u64) -> u64 {
    if ticks_per_second == 0 {
        return 0;
    }
    let numerator = u128::from(ticks) * 1000;
    let divisor = u128::from(ticks_per_second);
    let quotient = numerator / divisor;
    let twice_remainder = (numerator % divisor) * 2;
    let rounded = if twice_remainder > divisor || (twice_remainder == divisor && quotient % 2 == 1) {
        quotient + 1
    } else {
        quotient
    };
    u64::try_from(rounded).unwrap_or(u64::MAX)
}

pub fn duration_millis(elapsed: Duration) -> u64 {
    let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
    ticks_to_millis(nanos, 1_000_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_tick_converts_at_known_rate() {
        assert_eq!(ticks_to_millis(1, 1000), 1);
        assert_eq!(ticks_to_millis(1, 1), 1000);
        assert_eq!(ticks_to_millis(1, 10_000_000), 0);
    }

    #[test]
    fn halves_round_to_even() {
        // 0.5 ms, 1.5 ms, 2.5 ms, 3.5 ms
        assert_eq!(ticks_to_millis(1, 2000), 0);
        assert_eq!(ticks_to_millis(3, 2000), 2);
        assert_eq!(ticks_to_millis(5, 2000), 2);
        assert_eq!(ticks_to_millis(7, 2000), 4);
    }

    #[test]
    fn non_halves_round_to_nearest() {
        // 0.67 ms, 666.67 ms, 333.33 ms
        assert_eq!(ticks_to_millis(2, 3000), 1);
        assert_eq!(ticks_to_millis(2, 3), 667);
        assert_eq!(ticks_to_millis(1, 3), 333);
    }

    #[test]
    fn zero_rate_is_zero() {
        assert_eq!(ticks_to_millis(10, 0), 0);
    }

    #[test]
    fn duration_uses_nanosecond_ticks() {
        assert_eq!(duration_millis(Duration::from_micros(1500)), 2);
        assert_eq!(duration_millis(Duration::from_micros(2500)), 2);
        assert_eq!(duration_millis(Duration::from_millis(250)), 250);
    }
}
