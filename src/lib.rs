// Library root module for action-metrics
// This file defines the public API and module structure: per-action
// instrumentation for web request handlers, backed by Prometheus

pub mod backend;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod factory;
pub mod identity;
pub mod layer;
pub mod metrics;
pub mod names;
pub mod tracker;

pub use context::InstrumentationContext;
pub use errors::InstrumentError;
pub use identity::{ActionDescriptor, Invocation, OperationIdentity};
pub use tracker::OperationTracker;
