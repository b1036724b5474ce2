// Request-volume and latency collectors

use super::{duration_millis, Metric, MetricScope};
use crate::backend::{Counter, Gauge, Meter, MetricKind, Timer};
use crate::errors::Result;
use crate::identity::Invocation;
use std::sync::Arc;
use std::time::Duration;

/// Requests currently executing: up on start, down on completion.
pub struct ActiveRequestsMetric {
    in_progress: Arc<dyn Counter>,
}

impl ActiveRequestsMetric {
    pub fn new(scope: &MetricScope<'_>) -> Result<Self> {
        Ok(Self {
            in_progress: scope.backend.counter(&scope.key(MetricKind::ActiveRequests))?,
        })
    }
}

impl Metric for ActiveRequestsMetric {
    fn kind(&self) -> &str {
        "active_requests"
    }

    fn on_start(&self, _invocation: &Invocation) -> Result<()> {
        self.in_progress.increment();
        Ok(())
    }

    fn on_complete(&self, _invocation: &Invocation, _elapsed: Duration, _failed: bool) -> Result<()> {
        self.in_progress.decrement();
        Ok(())
    }

    fn release(&self) {
        self.in_progress.release();
    }
}

/// Records every call's duration.
pub struct CallTimerMetric {
    timer: Arc<dyn Timer>,
}

impl CallTimerMetric {
    pub fn new(scope: &MetricScope<'_>) -> Result<Self> {
        Ok(Self {
            timer: scope.backend.timer(&scope.key(MetricKind::CallDuration))?,
        })
    }
}

impl Metric for CallTimerMetric {
    fn kind(&self) -> &str {
        "call_timer"
    }

    fn on_complete(&self, _invocation: &Invocation, elapsed: Duration, _failed: bool) -> Result<()> {
        self.timer.record(elapsed);
        Ok(())
    }

    fn release(&self) {
        self.timer.release();
    }
}

/// Milliseconds taken by the most recent call.
pub struct LastCallElapsedMetric {
    gauge: Arc<dyn Gauge>,
}

impl LastCallElapsedMetric {
    pub fn new(scope: &MetricScope<'_>) -> Result<Self> {
        Ok(Self {
            gauge: scope.backend.gauge(&scope.key(MetricKind::LastCallElapsed))?,
        })
    }
}

impl Metric for LastCallElapsedMetric {
    fn kind(&self) -> &str {
        "last_call_elapsed"
    }

    fn on_complete(&self, _invocation: &Invocation, elapsed: Duration, _failed: bool) -> Result<()> {
        let millis = i64::try_from(duration_millis(elapsed)).unwrap_or(i64::MAX);
        self.gauge.set(millis);
        Ok(())
    }

    fn release(&self) {
        self.gauge.release();
    }
}

pub struct DeltaCallsMetric {
    calls: Arc<dyn Meter>,
}

impl DeltaCallsMetric {
    pub fn new(scope: &MetricScope<'_>) -> Result<Self> {
        Ok(Self {
            calls: scope.backend.meter(&scope.key(MetricKind::DeltaCalls))?,
        })
    }
}

impl Metric for DeltaCallsMetric {
    fn kind(&self) -> &str {
        "delta_calls"
    }

    fn on_complete(&self, _invocation: &Invocation, _elapsed: Duration, _failed: bool) -> Result<()> {
        self.calls.mark();
        Ok(())
    }

    fn release(&self) {
        self.calls.release();
    }
}
