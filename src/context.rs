// Instrumentation context
//
// Owns the name and bundle registries, the backend and the dispatcher for one
// process. Framework integrations hold a clone and pass it to every tracker;
// there is no hidden global.

use crate::backend::MetricsBackend;
use crate::config::InstrumentationSettings;
use crate::dispatch::{Dispatcher, Job, Reservation};
use crate::errors::Result;
use crate::factory::MetricBundleFactory;
use crate::identity::{ActionDescriptor, Invocation, OperationIdentity};
use crate::metrics::MetricConstructor;
use crate::names::NameSanitizer;
use crate::tracker::OperationTracker;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct InstrumentationContext {
    inner: Arc<Inner>,
}

struct Inner {
    category: String,
    process_id: u32,
    names: Arc<NameSanitizer>,
    factory: MetricBundleFactory,
    dispatcher: Dispatcher,
}

impl InstrumentationContext {
    /// Build a context with the dispatcher the settings ask for. Background
    /// dispatch must be set up from inside a tokio runtime.
    pub fn new(settings: &InstrumentationSettings, backend: Arc<dyn MetricsBackend>) -> Result<Self> {
        let dispatcher = Dispatcher::new(settings.dispatch, settings.queue_capacity)?;
        Ok(Self::with_dispatcher(settings, backend, dispatcher))
    }

    pub fn with_dispatcher(
        settings: &InstrumentationSettings,
        backend: Arc<dyn MetricsBackend>,
        dispatcher: Dispatcher,
    ) -> Self {
        let names = Arc::new(NameSanitizer::new());
        let factory = MetricBundleFactory::new(backend, Arc::clone(&names));
        info!(
            category = %settings.category,
            process_id = settings.process_id,
            dispatch = ?dispatcher.mode(),
            "action instrumentation enabled"
        );
        Self {
            inner: Arc::new(Inner {
                category: settings.category.clone(),
                process_id: settings.process_id,
                names,
                factory,
                dispatcher,
            }),
        }
    }

    pub fn category(&self) -> &str {
        &self.inner.category
    }

    pub fn process_id(&self) -> u32 {
        self.inner.process_id
    }

    /// Called by the framework before the action runs. The returned tracker is
    /// already started and must be handed back to `end_operation`.
    pub fn begin_operation(
        &self,
        descriptor: &ActionDescriptor,
        method: &str,
        content_length: u64,
    ) -> OperationTracker {
        let identity = OperationIdentity::from_descriptor(self.inner.process_id, descriptor, method);
        let mut tracker = OperationTracker::new(self.clone(), identity, Invocation::new(content_length));
        // A fresh tracker is always in the created state.
        let _ = tracker.start();
        tracker
    }

    /// Called by the framework once the action has run.
    pub fn end_operation(&self, mut tracker: OperationTracker, failed: bool) {
        // misuse is already logged by the tracker
        let _ = tracker.finish(failed);
    }

    /// Add a collector to every bundle created after this call. Register during
    /// startup, before traffic arrives.
    pub fn register_metric(&self, constructor: MetricConstructor) {
        self.inner.factory.register_extension(constructor);
    }

    pub fn bundle_count(&self) -> usize {
        self.inner.factory.len()
    }

    pub fn name_count(&self) -> usize {
        self.inner.names.len()
    }

    pub fn dropped_dispatches(&self) -> u64 {
        self.inner.dispatcher.dropped()
    }

    /// Wait for queued hook work to run.
    pub async fn flush(&self) {
        self.inner.dispatcher.flush().await;
    }

    /// Drain the dispatcher, then release every collector. Run once at teardown.
    pub async fn shutdown(&self) {
        self.inner.dispatcher.close().await;
        self.inner.factory.shutdown();
    }

    pub(crate) fn factory(&self) -> &MetricBundleFactory {
        &self.inner.factory
    }

    /// Queue start hooks and hold a slot for the matching completion. `None`
    /// means the call goes unmeasured.
    pub(crate) fn dispatch_paired(&self, identity: &OperationIdentity, job: Job) -> Option<Reservation> {
        match self.inner.dispatcher.dispatch_paired(job) {
            Ok(slot) => Some(slot),
            Err(err) => {
                debug!(identity = %identity, error = %err, "metric hooks dropped; call not measured");
                None
            }
        }
    }
}
