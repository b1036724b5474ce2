// Error types and error handling module
// This file defines the error type shared by the instrumentation core,
// the metrics backend and the dispatcher

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("metrics backend error: {0}")]
    Backend(String),
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metric hook failed: {0}")]
    Hook(String),
    #[error("tracker cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },
    #[error("metric dispatcher is closed")]
    DispatcherClosed,
    #[error("metric dispatch queue is full")]
    QueueFull,
    #[error("background dispatch requires a tokio runtime")]
    NoRuntime,
    #[error("instrumentation has been shut down")]
    ShutDown,
}

pub type Result<T, E = InstrumentError> = std::result::Result<T, E>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
