//! Host options and typed per-module configuration access.
//!
//! Two mechanisms for loading a module's configuration section:
//!
//! 1. **Lenient** (`module_config_or_default`): falls back to
//!    `T::default()` when the section is missing, so modules can exist
//!    without a configuration entry.
//! 2. **Strict** (`module_config_required`): errors when the section is
//!    missing or invalid.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::logging::HostLogger;

/// Configuration error for typed config operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("module '{module}' not found in configuration")]
    ModuleNotFound { module: String },

    #[error("invalid config for module '{module}': {source}")]
    InvalidConfig {
        module: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Provider of module-specific configuration (raw JSON sections only).
pub trait ConfigProvider: Send + Sync {
    /// Returns the raw JSON section for the module, if any.
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value>;
}

/// Provider with no sections; every lenient load yields defaults.
#[derive(Default)]
pub struct EmptyConfigProvider;

impl ConfigProvider for EmptyConfigProvider {
    fn get_module_config(&self, _module_name: &str) -> Option<&serde_json::Value> {
        None
    }
}

/// Lenient loader: missing or non-object sections become `T::default()`;
/// a present section that fails to deserialize is an error.
///
/// # Errors
/// Returns `ConfigError::InvalidConfig` if the section exists but cannot
/// be deserialized.
pub fn module_config_or_default<T: DeserializeOwned + Default>(
    provider: &dyn ConfigProvider,
    module_name: &str,
) -> Result<T, ConfigError> {
    let Some(section) = provider.get_module_config(module_name) else {
        return Ok(T::default());
    };
    serde_json::from_value(section.clone()).map_err(|e| ConfigError::InvalidConfig {
        module: module_name.to_owned(),
        source: e,
    })
}

/// Strict loader: the section must be present and valid.
///
/// # Errors
/// Returns `ConfigError` if the module has no section or the section is
/// invalid.
pub fn module_config_required<T: DeserializeOwned>(
    provider: &dyn ConfigProvider,
    module_name: &str,
) -> Result<T, ConfigError> {
    let section =
        provider
            .get_module_config(module_name)
            .ok_or_else(|| ConfigError::ModuleNotFound {
                module: module_name.to_owned(),
            })?;
    serde_json::from_value(section.clone()).map_err(|e| ConfigError::InvalidConfig {
        module: module_name.to_owned(),
        source: e,
    })
}

/// Monitoring switches consumed by the logging and memoization layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitoringOptions {
    /// Record span durations on monitored calls.
    pub enable_performance: bool,
    /// Skip monitoring spans entirely; monitored code runs bare.
    pub disable_monitoring: bool,
    /// Turn every memoized function into a pass-through.
    pub disable_memoization: bool,
    /// Log every memoization hit and miss.
    pub debug_memoization: bool,
}

/// One named layer with its rank. Lower levels are more foundational;
/// a consumer may only depend on providers at its own level or below.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiLayer {
    pub name: String,
    pub level: i32,
}

/// What to do when a component is bound outside the entry point
/// lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    #[default]
    Warn,
    Fail,
}

/// Host construction options.
///
/// Deserializable so a host can be configured from a file; the logger
/// and config provider are runtime-only and are attached with the
/// builder-style setters.
#[derive(Deserialize)]
#[serde(default)]
pub struct HostOptions {
    /// Layer ranking; `None` disables layering validation entirely.
    pub layers: Option<Vec<ApiLayer>>,
    /// Keep layer metadata but skip validation.
    pub disable_layers_validation: bool,
    /// Skip cycle detection; unresolvable descriptors are skipped with
    /// a warning instead of failing the batch.
    pub disable_cycle_check: bool,
    pub monitoring: MonitoringOptions,
    pub lifecycle_violation: ViolationPolicy,
    #[serde(skip)]
    pub logger: Option<Arc<dyn HostLogger>>,
    #[serde(skip)]
    pub config: Option<Arc<dyn ConfigProvider>>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            layers: None,
            disable_layers_validation: false,
            disable_cycle_check: false,
            monitoring: MonitoringOptions::default(),
            lifecycle_violation: ViolationPolicy::default(),
            logger: None,
            config: None,
        }
    }
}

impl HostOptions {
    pub fn with_layers(mut self, layers: Vec<ApiLayer>) -> Self {
        self.layers = Some(layers);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn HostLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigProvider>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_lifecycle_violation(mut self, policy: ViolationPolicy) -> Self {
        self.lifecycle_violation = policy;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringOptions) -> Self {
        self.monitoring = monitoring;
        self
    }
}

/// In-memory config provider backed by a JSON object keyed by module
/// name. Useful in tests and embedders that assemble config themselves.
pub struct StaticConfigProvider {
    modules: serde_json::Map<String, serde_json::Value>,
}

impl StaticConfigProvider {
    /// Builds a provider from `{ "<module>": { ...section... } }`.
    /// Non-object values yield an empty provider.
    pub fn new(modules: serde_json::Value) -> Self {
        let modules = match modules {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self { modules }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.modules.get(module_name)
    }
}
