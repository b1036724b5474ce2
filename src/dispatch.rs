// Hook dispatch
//
// Hands collector work off the request path. Background mode queues jobs on a
// bounded channel drained by a single worker task, so jobs run in the order
// they were queued. Dispatch is best-effort: when the queue is full the job is
// dropped and counted, and callers never wait for it to run.
//
// Start and completion hooks travel as a pair. Queuing a start also reserves
// the slot its completion will use, so a burst drops whole operations and
// never half of one.

use crate::errors::{InstrumentError, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run hooks on the calling thread.
    Inline,
    /// Run hooks on a background worker task.
    #[default]
    Background,
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue slot held for a follow-up job. Dropping it unused frees the slot.
pub struct Reservation {
    permit: Option<mpsc::OwnedPermit<Envelope>>,
}

impl Reservation {
    /// Queue `job` in the reserved slot, or run it now in inline mode.
    pub fn send(self, job: Job) {
        match self.permit {
            Some(permit) => {
                permit.send(Envelope::Job(job));
            }
            None => job(),
        }
    }
}

enum Envelope {
    Job(Job),
    Flush(oneshot::Sender<()>),
    Close,
}

struct Worker {
    tx: mpsc::Sender<Envelope>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

pub struct Dispatcher {
    worker: Option<Worker>,
    dropped: AtomicU64,
}

impl Dispatcher {
    pub fn inline() -> Self {
        Self {
            worker: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn background(capacity: usize) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| InstrumentError::NoRuntime)?;
        // a paired dispatch needs two slots
        let (tx, rx) = mpsc::channel(capacity.max(2));
        let handle = runtime.spawn(run_worker(rx));
        debug!(capacity, "metric dispatch worker started");
        Ok(Self {
            worker: Some(Worker {
                tx,
                handle: Mutex::new(Some(handle)),
                closed: AtomicBool::new(false),
            }),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn new(mode: DispatchMode, capacity: usize) -> Result<Self> {
        match mode {
            DispatchMode::Inline => Ok(Self::inline()),
            DispatchMode::Background => Self::background(capacity),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        if self.worker.is_some() {
            DispatchMode::Background
        } else {
            DispatchMode::Inline
        }
    }

    /// Queue `job`, or run it now in inline mode. Never blocks.
    pub fn dispatch(&self, job: Job) -> Result<()> {
        let Some(worker) = &self.worker else {
            job();
            return Ok(());
        };
        if worker.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(InstrumentError::DispatcherClosed);
        }
        worker.tx.try_send(Envelope::Job(job)).map_err(|err| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            rejected(err)
        })
    }

    /// Queue `first` and reserve a slot for the job that must follow it.
    ///
    /// Either both fit or neither is queued; a rejected pair counts as two
    /// dropped jobs. Never blocks.
    pub fn dispatch_paired(&self, first: Job) -> Result<Reservation> {
        let Some(worker) = &self.worker else {
            first();
            return Ok(Reservation { permit: None });
        };
        if worker.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(2, Ordering::Relaxed);
            return Err(InstrumentError::DispatcherClosed);
        }
        let reserved = worker
            .tx
            .clone()
            .try_reserve_owned()
            .map_err(rejected)
            .and_then(|follow_up| Ok((worker.tx.try_reserve().map_err(rejected)?, follow_up)));
        match reserved {
            Ok((permit, follow_up)) => {
                permit.send(Envelope::Job(first));
                Ok(Reservation {
                    permit: Some(follow_up),
                })
            }
            Err(err) => {
                self.dropped.fetch_add(2, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Jobs dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until every job queued before this call has run.
    pub async fn flush(&self) {
        let Some(worker) = &self.worker else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if worker.tx.send(Envelope::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Run what is already queued, then stop the worker. Later dispatches are
    /// rejected with `DispatcherClosed`.
    pub async fn close(&self) {
        let Some(worker) = &self.worker else {
            return;
        };
        if worker.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = worker.tx.send(Envelope::Close).await;
        let handle = worker
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                debug!(error = %err, "metric dispatch worker ended abnormally");
            }
        }
        info!(dropped = self.dropped(), "metric dispatch worker stopped");
    }
}

fn rejected<T>(err: mpsc::error::TrySendError<T>) -> InstrumentError {
    match err {
        mpsc::error::TrySendError::Full(_) => InstrumentError::QueueFull,
        mpsc::error::TrySendError::Closed(_) => InstrumentError::DispatcherClosed,
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Job(job) => job(),
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
            Envelope::Close => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<std::sync::Mutex<Vec<u32>>>, impl Fn(u32) -> Job) {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |n: u32| -> Job {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().expect("log").push(n))
        };
        (log, make)
    }

    #[test]
    fn inline_runs_immediately() {
        let dispatcher = Dispatcher::inline();
        let (log, job) = recorder();
        dispatcher.dispatch(job(1)).expect("dispatch");
        dispatcher.dispatch(job(2)).expect("dispatch");
        assert_eq!(*log.lock().expect("log"), vec![1, 2]);
        assert_eq!(dispatcher.mode(), DispatchMode::Inline);
    }

    #[test]
    fn background_needs_a_runtime() {
        assert!(matches!(
            Dispatcher::background(8),
            Err(InstrumentError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn background_preserves_queue_order() {
        let dispatcher = Dispatcher::background(64).expect("dispatcher");
        let (log, job) = recorder();
        for n in 0..20 {
            dispatcher.dispatch(job(n)).expect("dispatch");
        }
        dispatcher.flush().await;
        assert_eq!(*log.lock().expect("log"), (0..20).collect::<Vec<_>>());
        assert_eq!(dispatcher.dropped(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        // current-thread runtime: the worker cannot run until we yield
        let dispatcher = Dispatcher::background(2).expect("dispatcher");
        let (log, job) = recorder();
        let outcomes: Vec<_> = (0..4).map(|n| dispatcher.dispatch(job(n))).collect();

        assert!(outcomes[..2].iter().all(|r| r.is_ok()));
        assert!(outcomes[2..]
            .iter()
            .all(|r| matches!(r, Err(InstrumentError::QueueFull))));
        assert_eq!(dispatcher.dropped(), 2);

        dispatcher.flush().await;
        assert_eq!(*log.lock().expect("log"), vec![0, 1]);
    }

    #[tokio::test]
    async fn paired_dispatch_drops_whole_pairs() {
        let dispatcher = Dispatcher::background(3).expect("dispatcher");
        let (log, job) = recorder();

        let first = dispatcher.dispatch_paired(job(1)).expect("first pair");
        // one slot left: a second pair does not fit
        assert!(matches!(
            dispatcher.dispatch_paired(job(2)),
            Err(InstrumentError::QueueFull)
        ));
        assert_eq!(dispatcher.dropped(), 2);

        // the reserved slot still takes its job while the queue is full
        assert!(matches!(dispatcher.dispatch(job(3)), Ok(())));
        assert!(matches!(dispatcher.dispatch(job(4)), Err(InstrumentError::QueueFull)));
        first.send(job(10));

        dispatcher.flush().await;
        assert_eq!(*log.lock().expect("log"), vec![1, 3, 10]);
        assert_eq!(dispatcher.dropped(), 3);
    }

    #[tokio::test]
    async fn unused_reservation_frees_its_slot() {
        let dispatcher = Dispatcher::background(2).expect("dispatcher");
        let (log, job) = recorder();

        let reservation = dispatcher.dispatch_paired(job(1)).expect("pair");
        assert!(dispatcher.dispatch(job(2)).is_err());
        drop(reservation);
        dispatcher.dispatch(job(3)).expect("slot freed");

        dispatcher.flush().await;
        assert_eq!(*log.lock().expect("log"), vec![1, 3]);
    }

    #[test]
    fn inline_pairs_run_immediately() {
        let dispatcher = Dispatcher::inline();
        let (log, job) = recorder();
        let reservation = dispatcher.dispatch_paired(job(1)).expect("pair");
        assert_eq!(*log.lock().expect("log"), vec![1]);
        reservation.send(job(2));
        assert_eq!(*log.lock().expect("log"), vec![1, 2]);
    }

    #[tokio::test]
    async fn close_drains_then_rejects() {
        let dispatcher = Dispatcher::background(16).expect("dispatcher");
        let (log, job) = recorder();
        dispatcher.dispatch(job(7)).expect("dispatch");
        dispatcher.close().await;
        assert_eq!(*log.lock().expect("log"), vec![7]);

        assert!(matches!(
            dispatcher.dispatch(job(8)),
            Err(InstrumentError::DispatcherClosed)
        ));
        // closing twice is a no-op
        dispatcher.close().await;
    }
}
