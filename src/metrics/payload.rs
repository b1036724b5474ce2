// Request payload size collector

use super::{Metric, MetricScope};
use crate::backend::{Histogram, MetricKind};
use crate::errors::Result;
use crate::identity::Invocation;
use std::sync::Arc;

/// Body sizes of POST and PUT requests, recorded when the call starts.
pub struct PayloadSizeMetric {
    sizes: Arc<dyn Histogram>,
    records: bool,
}

impl PayloadSizeMetric {
    pub fn new(scope: &MetricScope<'_>) -> Result<Self> {
        Ok(Self {
            sizes: scope.backend.histogram(&scope.key(MetricKind::RequestSize))?,
            records: carries_payload(scope.identity.method()),
        })
    }
}

impl Metric for PayloadSizeMetric {
    fn kind(&self) -> &str {
        "payload_size"
    }

    fn on_start(&self, invocation: &Invocation) -> Result<()> {
        if self.records {
            self.sizes.update(invocation.content_length);
        }
        Ok(())
    }

    fn release(&self) {
        self.sizes.release();
    }
}

fn carries_payload(method: &str) -> bool {
    method.eq_ignore_ascii_case("POST") || method.eq_ignore_ascii_case("PUT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PrometheusBackend;
    use crate::identity::OperationIdentity;

    fn recorded(method: &str, lengths: &[u64]) -> (u64, f64) {
        let backend = PrometheusBackend::new("Test").expect("backend");
        let identity = OperationIdentity::new(1, "MVC", "Cart", "Add", method, Vec::new());
        let scope = MetricScope {
            identity: &identity,
            instance: identity.raw(),
            backend: &backend,
        };
        let metric = PayloadSizeMetric::new(&scope).expect("metric");
        for len in lengths {
            metric.on_start(&Invocation::new(*len)).expect("start");
        }
        backend
            .registry()
            .gather()
            .iter()
            .find(|mf| mf.get_name() == "test_request_size_bytes")
            .and_then(|mf| mf.get_metric().first().cloned())
            .map(|m| (m.get_histogram().get_sample_count(), m.get_histogram().get_sample_sum()))
            .unwrap_or_default()
    }

    #[test]
    fn post_and_put_record_content_length() {
        assert_eq!(recorded("POST", &[100, 300]), (2, 400.0));
        assert_eq!(recorded("put", &[512]), (1, 512.0));
        assert_eq!(recorded("Post", &[0]), (1, 0.0));
    }

    #[test]
    fn other_methods_are_ignored() {
        assert_eq!(recorded("GET", &[100]), (0, 0.0));
        assert_eq!(recorded("DELETE", &[100]), (0, 0.0));
        assert_eq!(recorded("PATCH", &[100]), (0, 0.0));
    }
}
