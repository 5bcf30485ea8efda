//! plugkit — module lifecycle engine and extension-point registry.
//!
//! Independently authored modules ("shells") plug into one running
//! application: each contributes capabilities (APIs), pieces of shared
//! state, and entries in named extension slots, without the modules
//! knowing about each other directly. The host installs and uninstalls
//! batches of modules dynamically, resolves their mutual capability
//! dependencies, enforces layering between providers, and keeps one
//! module's failure from corrupting the rest of the application.
//!
//! The moving parts:
//! - [`host::AppHost`] owns the module, capability, and slot tables
//!   and drives attach/extend/detach in resolved dependency order.
//! - [`shell::Shell`] is the explicit per-module facade modules act
//!   through; nothing is resolved ambiently.
//! - [`slot::ExtensionSlot`] holds named, typed, ordered multi-value
//!   extension points with read-time activation predicates.
//! - [`store::ThrottledStore`] aggregates state with batched
//!   notifications and an explicit flush.
//! - [`binder`] connects renderable units to derived state slices
//!   with equality-gated recomputation.
//! - [`memoize`] caches per-module derivations invalidated by explicit
//!   triggers or state-change generations.
//!
//! ```no_run
//! use std::sync::Arc;
//! use plugkit::{ApiKey, AppHost, EntryPointDef, HostOptions, ShellDescriptor};
//!
//! pub trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//! const GREETER: ApiKey<dyn Greeter> = ApiKey::new("demo.greeter");
//!
//! struct EnglishGreeter;
//! impl Greeter for EnglishGreeter {
//!     fn greet(&self) -> String {
//!         "hello".to_owned()
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let host = AppHost::new(HostOptions::default());
//! host.add_shells(vec![
//!     ShellDescriptor::ready(
//!         EntryPointDef::new("greeting")
//!             .provides([GREETER.erased()])
//!             .on_attach(|shell| {
//!                 shell.contribute_api(&GREETER, Arc::new(EnglishGreeter))?;
//!                 Ok(())
//!             }),
//!     ),
//! ])
//! .await?;
//! assert_eq!(host.get_api(&GREETER)?.greet(), "hello");
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod binder;
pub mod config;
pub mod contracts;
pub mod errors;
pub mod host;
pub mod logging;
pub mod memoize;
pub mod render;
mod resolver;
pub mod shell;
pub mod slot;
pub mod store;

pub use api::{AnyApiKey, ApiKey, Dependency, SlotKey};
pub use binder::{bind_with_shell, BindingOptions, StateBinding};
pub use config::{
    module_config_or_default, module_config_required, ApiLayer, ConfigError, ConfigProvider,
    EmptyConfigProvider, HostOptions, MonitoringOptions, StaticConfigProvider, ViolationPolicy,
};
pub use contracts::{
    EntryPoint, EntryPointDef, EntryPointInfo, EntryPointInterceptor, LazyEntryPoint,
    ShellDescriptor,
};
pub use errors::{
    ApiError, ConfigurationError, DependencyError, HostError, InstallError, InstallPhase,
    LifecycleError, ShellFailure, SlotError, StoreError,
};
pub use host::AppHost;
pub use logging::{HostLogger, LogSpan, Severity, ShellLogger, TracingLogger};
pub use memoize::{MemoSnapshot, Memoized};
pub use render::{render_contributions, Contributor, Fragment, ViewFactory, MAIN_VIEW};
pub use shell::{LifecycleState, ScopedStore, Shell};
pub use slot::{
    Contribution, CustomExtensionSlot, CustomSlotHandler, ExtensionItem, ExtensionSlot, Predicate,
};
pub use store::{Action, Subscription, ThrottledStore};
