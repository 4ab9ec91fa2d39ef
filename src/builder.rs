//! Fluent builder for Runtime construction.
//!
//! Provides a builder pattern interface for creating and configuring Runtime instances.

use crate::config::{ConfigError, RuntimeConfig, TimeMode};
use crate::error::Error;
use crate::runtime::Runtime;
use crate::runtime::scheduler::UnhandledSink;

use std::rc::Rc;

/// Builder for constructing Runtime instances with fluent API.
///
/// # Example
/// ```ignore
/// let rt = RuntimeBuilder::new()
///     .default_workers(2)
///     .on_unhandled_error(|err| eprintln!("lost: {err}"))
///     .build();
/// ```
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    sink: Option<UnhandledSink>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Creates a builder with [`RuntimeConfig::default`] settings.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            sink: None,
        }
    }

    /// Creates a builder seeded from `COTASK_*` environment variables.
    ///
    /// Builder methods called afterwards still take precedence.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::new();
        builder.config.apply_env()?;
        Ok(builder)
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of logical worker slots in the default pool (at least 1).
    pub fn default_workers(mut self, workers: usize) -> Self {
        self.config.default_workers = workers;
        self
    }

    /// Selects virtual or paced time.
    pub fn time_mode(mut self, mode: TimeMode) -> Self {
        self.config.time_mode = mode;
        self
    }

    /// Installs a callback for failures of detached tasks that nobody observed.
    ///
    /// Such failures are always logged; the callback is an additional hook.
    pub fn on_unhandled_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&Error) + 'static,
    {
        self.sink = Some(Rc::new(sink));
        self
    }

    /// Builds and returns a configured Runtime instance.
    pub fn build(self) -> Runtime {
        let mut config = self.config;
        config.normalize();

        Runtime::with_config(config, self.sink)
    }
}
