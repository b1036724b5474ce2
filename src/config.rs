// Configuration management module
// This file handles loading and parsing of configuration settings
// from environment variables

use crate::dispatch::{DispatchMode, DEFAULT_QUEUE_CAPACITY};
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Demo server bind address, e.g. 0.0.0.0:8080
    pub listen_addr: Option<String>,
    /// Seconds between heartbeat log lines (default 30)
    pub heartbeat_secs: Option<u64>,
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,
}

impl AppConfig {
    /// Read `ACTION_METRICS__*` environment variables, e.g.
    /// `ACTION_METRICS__INSTRUMENTATION__CATEGORY=MusicStore`.
    pub fn load() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("ACTION_METRICS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("read environment configuration")?;
        Self::from_config(cfg)
    }

    pub fn from_config(cfg: config::Config) -> Result<Self> {
        cfg.try_deserialize().context("deserialize configuration")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstrumentationConfig {
    /// Metrics category name. Instrumentation stays off while this is unset.
    pub category: Option<String>,
    /// Explicit kill switch; a set category with `enabled = false` stays off.
    pub enabled: Option<bool>,
    /// background (default) or inline
    #[serde(default)]
    pub dispatch: DispatchMode,
    /// Background queue depth before hook work is dropped
    pub queue_capacity: Option<usize>,
}

impl InstrumentationConfig {
    /// Resolved settings, or None when instrumentation is disabled.
    pub fn settings(&self) -> Option<InstrumentationSettings> {
        if self.enabled == Some(false) {
            info!("action instrumentation disabled by configuration");
            return None;
        }
        let category = match self.category.as_deref().map(str::trim) {
            Some(category) if !category.is_empty() => category,
            _ => {
                info!("no instrumentation category configured; action instrumentation disabled");
                return None;
            }
        };
        Some(
            InstrumentationSettings::new(category)
                .with_dispatch(self.dispatch)
                .with_queue_capacity(self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY)),
        )
    }
}

/// Settings an enabled context is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationSettings {
    pub category: String,
    pub process_id: u32,
    pub dispatch: DispatchMode,
    pub queue_capacity: usize,
}

impl InstrumentationSettings {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            process_id: std::process::id(),
            dispatch: DispatchMode::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_process_id(mut self, process_id: u32) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}
