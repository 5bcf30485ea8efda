//! Error taxonomy for the host.
//!
//! The groups match how failures are contained:
//! - [`ConfigurationError`] aborts the offending registration only.
//! - [`DependencyError`] aborts the whole installation batch before any
//!   attach hook runs.
//! - [`LifecycleError`] is raised at the access site and is non-fatal to
//!   the host.
//! - Hook failures are carried as [`ShellFailure`] entries inside an
//!   [`InstallError`]; the failing shell is rolled back, its siblings
//!   are not.

use std::fmt;

/// Duplicate registrations, detected synchronously at the call site.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("shell '{module}' is already installed or pending")]
    DuplicateShell { module: String },

    #[error("API '{key}' is already provided by shell '{existing}'")]
    DuplicateApi { key: String, existing: String },

    #[error("state section '{section}' is already contributed by shell '{existing}'")]
    DuplicateStateSection { section: String, existing: String },
}

/// Batch resolution failures. Any of these aborts the entire batch.
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("shell '{module}' requires API '{key}' which no installed or batched shell provides")]
    Missing { module: String, key: String },

    #[error("circular dependency: {}", cycle.join(" -> "))]
    Circular { cycle: Vec<String> },

    #[error(
        "layer violation: shell '{consumer}' (layer '{consumer_layer}') may not depend on \
         API '{key}' provided by '{provider}' (layer '{provider_layer}')"
    )]
    LayerViolation {
        consumer: String,
        consumer_layer: String,
        provider: String,
        provider_layer: String,
        key: String,
    },

    #[error("unknown layer '{layer}' on shell or API of '{module}'")]
    UnknownLayer { module: String, layer: String },
}

/// Capability or store access outside the allowed lifecycle window.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("shell '{module}' accessed API '{key}' before its dependencies were satisfied")]
    ApisNotReady { module: String, key: String },

    #[error("shell '{module}' accessed the store before its dependencies were satisfied")]
    StoreNotReady { module: String },

    #[error("shell '{module}' is detached")]
    Detached { module: String },

    #[error("component bound outside the entry point lifecycle of shell '{module}'")]
    OutOfLifecycle { module: String },
}

/// Typed capability lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API not found: '{key}'")]
    NotFound { key: String },

    #[error("API '{key}' is registered with a different type")]
    TypeMismatch { key: String },
}

/// Extension slot lookup and retrieval failures.
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("extension slot not found: '{key}'")]
    NotFound { key: String },

    #[error("extension slot '{key}' was declared with a different item type")]
    TypeMismatch { key: String },

    #[error("extension slot '{key}' has no active items")]
    Empty { key: String },

    #[error("extension slot '{key}' has {count} active items where exactly one was expected")]
    Ambiguous { key: String, count: usize },

    #[error("no item named '{name}' in extension slot '{key}'")]
    ItemNotFound { key: String, name: String },
}

/// Typed state section access failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state section not found: '{section}'")]
    SectionNotFound { section: String },

    #[error("state section '{section}' holds a different type")]
    SectionTypeMismatch { section: String },
}

/// Which installation step a shell failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Registration,
    Attach,
    Extend,
    Detach,
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallPhase::Registration => "registration",
            InstallPhase::Attach => "attach",
            InstallPhase::Extend => "extend",
            InstallPhase::Detach => "detach",
        };
        f.write_str(s)
    }
}

/// One shell that was rejected or rolled back during a batch.
#[derive(Debug)]
pub struct ShellFailure {
    pub module: String,
    pub phase: InstallPhase,
    pub source: anyhow::Error,
}

impl fmt::Display for ShellFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' failed during {}: {}", self.module, self.phase, self.source)
    }
}

/// Outcome of `add_shells` when not everything installed.
///
/// `Dependency` means nothing from the batch was attached. `Shells`
/// means the named shells were rejected or rolled back while their
/// siblings installed normally.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("{} shell(s) were rejected or rolled back: {}", .0.len(),
            .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Shells(Vec<ShellFailure>),
}

/// Umbrella error for shell-scoped operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
