// Error-rate collector

use super::{Metric, MetricScope};
use crate::backend::{Meter, MetricKind};
use crate::errors::Result;
use crate::identity::Invocation;
use std::sync::Arc;
use std::time::Duration;

/// Marks once per call that ended in an unhandled failure.
pub struct ErrorRateMetric {
    errors: Arc<dyn Meter>,
}

impl ErrorRateMetric {
    pub fn new(scope: &MetricScope<'_>) -> Result<Self> {
        Ok(Self {
            errors: scope.backend.meter(&scope.key(MetricKind::Errors))?,
        })
    }
}

impl Metric for ErrorRateMetric {
    fn kind(&self) -> &str {
        "error_rate"
    }

    fn on_complete(&self, _invocation: &Invocation, _elapsed: Duration, failed: bool) -> Result<()> {
        if failed {
            self.errors.mark();
        }
        Ok(())
    }

    fn release(&self) {
        self.errors.release();
    }
}
