// Metric bundle registry
// Creates the ordered collector set for an operation identity the first time
// it is seen and hands out the cached set afterwards

use crate::backend::MetricsBackend;
use crate::errors::{panic_message, InstrumentError, Result};
use crate::identity::OperationIdentity;
use crate::metrics::{builtin_constructors, Metric, MetricConstructor, MetricScope};
use crate::names::NameSanitizer;
use dashmap::DashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Collectors bound to one operation identity.
pub struct MetricBundle {
    identity: OperationIdentity,
    instance: Arc<str>,
    metrics: Vec<Box<dyn Metric>>,
}

impl MetricBundle {
    pub fn identity(&self) -> &OperationIdentity {
        &self.identity
    }

    /// Sanitized identity.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn metrics(&self) -> &[Box<dyn Metric>] {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    fn release(&self) {
        for metric in &self.metrics {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| metric.release())) {
                warn!(
                    instance = %self.instance,
                    metric = metric.kind(),
                    panic = %panic_message(panic.as_ref()),
                    "metric release panicked"
                );
            }
        }
    }
}

pub struct MetricBundleFactory {
    backend: Arc<dyn MetricsBackend>,
    names: Arc<NameSanitizer>,
    builtins: Vec<MetricConstructor>,
    extensions: RwLock<Vec<MetricConstructor>>,
    bundles: DashMap<OperationIdentity, Arc<MetricBundle>>,
    /// Serializes bundle creation and shutdown. True once shut down.
    create_lock: Mutex<bool>,
}

impl MetricBundleFactory {
    pub fn new(backend: Arc<dyn MetricsBackend>, names: Arc<NameSanitizer>) -> Self {
        Self::with_builtins(backend, names, builtin_constructors())
    }

    pub fn with_builtins(
        backend: Arc<dyn MetricsBackend>,
        names: Arc<NameSanitizer>,
        builtins: Vec<MetricConstructor>,
    ) -> Self {
        Self {
            backend,
            names,
            builtins,
            extensions: RwLock::new(Vec::new()),
            bundles: DashMap::new(),
            create_lock: Mutex::new(false),
        }
    }

    /// Add a collector to every bundle created from now on.
    pub fn register_extension(&self, constructor: MetricConstructor) {
        let mut extensions = self.extensions.write().unwrap_or_else(PoisonError::into_inner);
        extensions.push(constructor);
        debug!(extensions = extensions.len(), "registered metric extension");
    }

    /// Cached bundle for `identity`, built at most once per identity.
    pub fn bundle(&self, identity: &OperationIdentity) -> Result<Arc<MetricBundle>> {
        if let Some(bundle) = self.cached(identity) {
            return Ok(bundle);
        }

        let closed = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(InstrumentError::ShutDown);
        }
        if let Some(bundle) = self.cached(identity) {
            return Ok(bundle);
        }

        let bundle = Arc::new(self.build(identity));
        self.bundles.insert(identity.clone(), Arc::clone(&bundle));
        debug!(
            identity = %identity,
            instance = %bundle.instance(),
            metrics = bundle.len(),
            "created metric bundle"
        );
        Ok(bundle)
    }

    fn cached(&self, identity: &OperationIdentity) -> Option<Arc<MetricBundle>> {
        self.bundles.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    fn build(&self, identity: &OperationIdentity) -> MetricBundle {
        let instance = self.names.resolve(identity.raw());
        let extensions = self
            .extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let scope = MetricScope {
            identity,
            instance: &instance,
            backend: self.backend.as_ref(),
        };

        let mut metrics = Vec::with_capacity(self.builtins.len() + extensions.len());
        for constructor in self.builtins.iter().chain(extensions.iter()) {
            match panic::catch_unwind(AssertUnwindSafe(|| constructor(&scope))) {
                Ok(Ok(metric)) => metrics.push(metric),
                Ok(Err(err)) => {
                    warn!(identity = %identity, error = %err, "metric constructor failed; skipping");
                }
                Err(panic) => {
                    warn!(
                        identity = %identity,
                        panic = %panic_message(panic.as_ref()),
                        "metric constructor panicked; skipping"
                    );
                }
            }
        }

        MetricBundle {
            identity: identity.clone(),
            instance,
            metrics,
        }
    }

    /// Release every collector and empty the cache. Later `bundle` calls fail
    /// with `ShutDown`. Must not race with ongoing `bundle` traffic.
    pub fn shutdown(&self) {
        let mut closed = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return;
        }
        *closed = true;

        let count = self.bundles.len();
        for entry in self.bundles.iter() {
            entry.value().release();
        }
        self.bundles.clear();
        info!(bundles = count, "released metric bundles");
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}
