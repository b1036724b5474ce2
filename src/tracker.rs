// Per-invocation operation tracker
//
// One tracker follows a single call through Created -> Started -> Completed.
// Hook work goes through the context's dispatcher and every hook runs under
// catch_unwind, so a misbehaving collector only costs its own measurement.

use crate::context::InstrumentationContext;
use crate::dispatch::Reservation;
use crate::errors::{panic_message, InstrumentError, Result};
use crate::factory::MetricBundle;
use crate::identity::{Invocation, OperationIdentity};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum State {
    Created,
    Started {
        started_at: Instant,
        /// None when the bundle could not be resolved or the start hooks were
        /// dropped; finish then does nothing.
        pending: Option<Pending>,
    },
    Completed,
}

/// Completion work owed by a started call: its bundle and the queue slot
/// reserved when the start hooks were queued.
struct Pending {
    bundle: Arc<MetricBundle>,
    slot: Reservation,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Started { .. } => "started",
            State::Completed => "completed",
        }
    }
}

pub struct OperationTracker {
    context: InstrumentationContext,
    identity: OperationIdentity,
    invocation: Invocation,
    state: State,
}

impl OperationTracker {
    pub fn new(context: InstrumentationContext, identity: OperationIdentity, invocation: Invocation) -> Self {
        Self {
            context,
            identity,
            invocation,
            state: State::Created,
        }
    }

    pub fn identity(&self) -> &OperationIdentity {
        &self.identity
    }

    pub fn state(&self) -> &'static str {
        self.state.name()
    }

    /// Resolve the bundle, start the clock and queue the start hooks.
    ///
    /// Fails only on misuse (the tracker was already started); nothing is
    /// dispatched in that case. Instrumentation failures are logged, not returned.
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, State::Created) {
            return Err(self.misuse("start"));
        }

        let bundle = match self.context.factory().bundle(&self.identity) {
            Ok(bundle) => Some(bundle),
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "metric bundle unavailable; call not measured");
                None
            }
        };

        let started_at = Instant::now();
        let pending = bundle.and_then(|bundle| {
            let hooks = Arc::clone(&bundle);
            let invocation = self.invocation;
            self.context
                .dispatch_paired(&self.identity, Box::new(move || notify_start(&hooks, &invocation)))
                .map(|slot| Pending { bundle, slot })
        });
        self.state = State::Started { started_at, pending };
        Ok(())
    }

    /// Stop the clock and queue the completion hooks.
    ///
    /// Calling this before `start` or a second time returns `InvalidTransition`
    /// and leaves the tracker untouched.
    pub fn finish(&mut self, failed: bool) -> Result<()> {
        let (started_at, pending) = match std::mem::replace(&mut self.state, State::Completed) {
            State::Started { started_at, pending } => (started_at, pending),
            other => {
                self.state = other;
                return Err(self.misuse("finish"));
            }
        };

        if let Some(Pending { bundle, slot }) = pending {
            let elapsed = started_at.elapsed();
            let invocation = self.invocation;
            slot.send(Box::new(move || notify_complete(&bundle, &invocation, elapsed, failed)));
        }
        Ok(())
    }

    fn misuse(&self, operation: &'static str) -> InstrumentError {
        let state = self.state.name();
        debug!(identity = %self.identity, operation, state, "ignored out-of-order tracker call");
        InstrumentError::InvalidTransition { operation, state }
    }
}

fn notify_start(bundle: &MetricBundle, invocation: &Invocation) {
    for metric in bundle.metrics() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| metric.on_start(invocation)));
        report(bundle, metric.kind(), "on_start", outcome);
    }
}

fn notify_complete(bundle: &MetricBundle, invocation: &Invocation, elapsed: Duration, failed: bool) {
    for metric in bundle.metrics() {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| metric.on_complete(invocation, elapsed, failed)));
        report(bundle, metric.kind(), "on_complete", outcome);
    }
}

fn report(
    bundle: &MetricBundle,
    metric: &str,
    hook: &'static str,
    outcome: std::thread::Result<Result<()>>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(instance = %bundle.instance(), metric, hook, error = %err, "metric hook failed");
        }
        Err(panic) => {
            warn!(
                instance = %bundle.instance(),
                metric,
                hook,
                panic = %panic_message(panic.as_ref()),
                "metric hook panicked"
            );
        }
    }
}
