//! The application host: module table, capability table, slot table,
//! and the lifecycle engine that drives batches of shells through
//! attach/extend/detach in resolved dependency order.
//!
//! All registry mutation runs on one logical thread; the locks below
//! only guard against reentrant reads during hooks and are never held
//! across a hook invocation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::api::{ApiKey, Dependency, SlotKey};
use crate::config::{ConfigProvider, EmptyConfigProvider, HostOptions, MonitoringOptions, ViolationPolicy};
use crate::contracts::{
    apply_interceptors, EntryPoint, EntryPointInfo, EntryPointInterceptor, LazyEntryPoint,
    ShellDescriptor,
};
use crate::errors::{
    ApiError, ConfigurationError, DependencyError, InstallError, InstallPhase, ShellFailure,
    SlotError,
};
use crate::logging::{HostLogger, TracingLogger};
use crate::render::{render_contributions, Fragment, ViewFactory, MAIN_VIEW};
use crate::resolver::{resolve_order, BatchModule, InstalledProvider};
use crate::shell::{LifecycleState, Shell};
use crate::slot::{CustomExtensionSlot, CustomSlotHandler, ErasedSlot, ExtensionSlot};
use crate::store::ThrottledStore;

/// Module name the host itself uses for slots it declares.
const HOST_MODULE: &str = "plugkit.host";

struct ApiEntry {
    provider: Arc<str>,
    /// Effective layer: key layer, falling back to the provider's.
    layer: Option<String>,
    value: Box<dyn std::any::Any + Send + Sync>,
}

struct SlotEntry {
    declaring_module: Arc<str>,
    typed: Box<dyn std::any::Any + Send + Sync>,
    erased: Arc<dyn ErasedSlot>,
}

type ShellsChangedCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

pub(crate) struct HostCore {
    options: HostOptions,
    logger: Arc<dyn HostLogger>,
    config: Arc<dyn ConfigProvider>,
    layer_index: Option<HashMap<String, i32>>,
    store: Arc<ThrottledStore>,
    /// Installed shells in install order.
    shells: RwLock<Vec<Shell>>,
    apis: RwLock<HashMap<String, ApiEntry>>,
    slots: RwLock<HashMap<String, SlotEntry>>,
    /// Names of lazy entry points whose factories are still pending.
    lazy: RwLock<HashSet<String>>,
    /// Every name that was requested and not yet removed; a lazy
    /// factory resolving for a name outside this set is discarded.
    wanted: RwLock<HashSet<String>>,
    interceptors: RwLock<Vec<Arc<dyn EntryPointInterceptor>>>,
    shells_changed: RwLock<Vec<(u64, ShellsChangedCallback)>>,
    next_callback_id: AtomicU64,
}

fn slot_change_hook(store: &Arc<ThrottledStore>) -> Arc<dyn Fn() + Send + Sync> {
    let weak = Arc::downgrade(store);
    Arc::new(move || {
        if let Some(store) = weak.upgrade() {
            store.signal_change();
        }
    })
}

impl HostCore {
    pub(crate) fn logger(&self) -> Arc<dyn HostLogger> {
        Arc::clone(&self.logger)
    }

    pub(crate) fn config_provider(&self) -> Arc<dyn ConfigProvider> {
        Arc::clone(&self.config)
    }

    pub(crate) fn store(&self) -> Arc<ThrottledStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn monitoring(&self) -> MonitoringOptions {
        self.options.monitoring
    }

    pub(crate) fn lifecycle_violation(&self) -> ViolationPolicy {
        self.options.lifecycle_violation
    }

    pub(crate) fn get_api<T>(&self, key: &ApiKey<T>) -> Result<Arc<T>, ApiError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let apis = self.apis.read();
        let entry = apis.get(key.name()).ok_or_else(|| ApiError::NotFound {
            key: key.name().to_owned(),
        })?;
        entry
            .value
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or_else(|| ApiError::TypeMismatch {
                key: key.name().to_owned(),
            })
    }

    pub(crate) fn register_api<T>(
        &self,
        module: &Arc<str>,
        module_layer: Option<&str>,
        key: &ApiKey<T>,
        value: Arc<T>,
    ) -> Result<(), ConfigurationError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let mut apis = self.apis.write();
        if let Some(existing) = apis.get(key.name()) {
            return Err(ConfigurationError::DuplicateApi {
                key: key.name().to_owned(),
                existing: existing.provider.to_string(),
            });
        }
        let layer = key
            .layer()
            .map(str::to_owned)
            .or_else(|| module_layer.map(str::to_owned));
        apis.insert(
            key.name().to_owned(),
            ApiEntry {
                provider: Arc::clone(module),
                layer,
                value: Box::new(value),
            },
        );
        Ok(())
    }

    fn unregister_apis_of(&self, module: &str) {
        self.apis.write().retain(|_, e| e.provider.as_ref() != module);
    }

    pub(crate) fn declare_slot<T>(
        &self,
        module: &Arc<str>,
        key: &SlotKey<T>,
    ) -> Result<Arc<ExtensionSlot<T>>, SlotError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut slots = self.slots.write();
        if let Some(entry) = slots.get(key.name()) {
            return entry
                .typed
                .downcast_ref::<Arc<ExtensionSlot<T>>>()
                .cloned()
                .ok_or_else(|| SlotError::TypeMismatch {
                    key: key.name().to_owned(),
                });
        }
        let slot = Arc::new(ExtensionSlot::<T>::new(
            key.name().to_owned(),
            Arc::clone(module),
            slot_change_hook(&self.store),
        ));
        slots.insert(
            key.name().to_owned(),
            SlotEntry {
                declaring_module: Arc::clone(module),
                typed: Box::new(Arc::clone(&slot)),
                erased: Arc::clone(&slot) as Arc<dyn ErasedSlot>,
            },
        );
        Ok(slot)
    }

    pub(crate) fn declare_custom_slot<T>(
        &self,
        module: &Arc<str>,
        key: &SlotKey<T>,
        handler: Arc<dyn CustomSlotHandler<T>>,
    ) -> Result<Arc<CustomExtensionSlot<T>>, SlotError>
    where
        T: Send + Sync + 'static,
    {
        let mut slots = self.slots.write();
        if let Some(entry) = slots.get(key.name()) {
            return entry
                .typed
                .downcast_ref::<Arc<CustomExtensionSlot<T>>>()
                .cloned()
                .ok_or_else(|| SlotError::TypeMismatch {
                    key: key.name().to_owned(),
                });
        }
        let slot = Arc::new(CustomExtensionSlot::<T>::new(
            key.name().to_owned(),
            Arc::clone(module),
            handler,
            slot_change_hook(&self.store),
        ));
        slots.insert(
            key.name().to_owned(),
            SlotEntry {
                declaring_module: Arc::clone(module),
                typed: Box::new(Arc::clone(&slot)),
                erased: Arc::clone(&slot) as Arc<dyn ErasedSlot>,
            },
        );
        Ok(slot)
    }

    pub(crate) fn get_slot<T>(&self, key: &SlotKey<T>) -> Result<Arc<ExtensionSlot<T>>, SlotError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let slots = self.slots.read();
        let entry = slots.get(key.name()).ok_or_else(|| SlotError::NotFound {
            key: key.name().to_owned(),
        })?;
        entry
            .typed
            .downcast_ref::<Arc<ExtensionSlot<T>>>()
            .cloned()
            .ok_or_else(|| SlotError::TypeMismatch {
                key: key.name().to_owned(),
            })
    }

    fn deps_satisfied(&self, deps: &[Dependency]) -> bool {
        let apis = self.apis.read();
        deps.iter()
            .filter(|d| !d.optional)
            .all(|d| apis.contains_key(d.key.name))
    }

    /// Removes every trace of the module from the registries: its slot
    /// items everywhere, the slots it declared, its APIs, and its state
    /// sections.
    fn sweep_module(&self, module: &str) {
        let erased: Vec<Arc<dyn ErasedSlot>> = self
            .slots
            .read()
            .values()
            .map(|e| Arc::clone(&e.erased))
            .collect();
        for slot in erased {
            slot.discard_module(module);
        }

        let removed: Vec<String> = {
            let mut slots = self.slots.write();
            let keys: Vec<String> = slots
                .iter()
                .filter(|(_, e)| e.declaring_module.as_ref() == module)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                slots.remove(key);
            }
            keys
        };
        if !removed.is_empty() {
            tracing::debug!(module, slots = ?removed, "removed declared slots");
            self.store.signal_change();
        }

        self.unregister_apis_of(module);
        self.store.remove_sections_of(module);
    }

    fn shell_names(&self) -> Vec<String> {
        self.shells
            .read()
            .iter()
            .map(|s| s.name().to_owned())
            .collect()
    }

    fn notify_shells_changed(&self) {
        let names = self.shell_names();
        let callbacks: Vec<ShellsChangedCallback> = self
            .shells_changed
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&names);
        }
    }
}

/// The application host. Cheap to clone; independent hosts are fully
/// isolated from each other, so tests construct their own.
#[derive(Clone)]
pub struct AppHost {
    core: Arc<HostCore>,
}

impl AppHost {
    pub fn new(options: HostOptions) -> Self {
        let logger: Arc<dyn HostLogger> = options
            .logger
            .clone()
            .unwrap_or_else(|| Arc::new(TracingLogger));
        let config: Arc<dyn ConfigProvider> = options
            .config
            .clone()
            .unwrap_or_else(|| Arc::new(EmptyConfigProvider));
        let layer_index = if options.disable_layers_validation {
            None
        } else {
            options.layers.as_ref().map(|layers| {
                layers
                    .iter()
                    .map(|l| (l.name.clone(), l.level))
                    .collect::<HashMap<_, _>>()
            })
        };

        let store = Arc::new(ThrottledStore::new());
        let host_module: Arc<str> = Arc::from(HOST_MODULE);
        let main_view = Arc::new(ExtensionSlot::<ViewFactory>::new(
            MAIN_VIEW.name().to_owned(),
            Arc::clone(&host_module),
            slot_change_hook(&store),
        ));
        let mut slots = HashMap::new();
        slots.insert(
            MAIN_VIEW.name().to_owned(),
            SlotEntry {
                declaring_module: host_module,
                typed: Box::new(Arc::clone(&main_view)),
                erased: main_view as Arc<dyn ErasedSlot>,
            },
        );

        Self {
            core: Arc::new(HostCore {
                options,
                logger,
                config,
                layer_index,
                store,
                shells: RwLock::new(Vec::new()),
                apis: RwLock::new(HashMap::new()),
                slots: RwLock::new(slots),
                lazy: RwLock::new(HashSet::new()),
                wanted: RwLock::new(HashSet::new()),
                interceptors: RwLock::new(Vec::new()),
                shells_changed: RwLock::new(Vec::new()),
                next_callback_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &HostOptions {
        &self.core.options
    }

    pub fn logger(&self) -> Arc<dyn HostLogger> {
        self.core.logger()
    }

    /// The aggregated store.
    pub fn store(&self) -> Arc<ThrottledStore> {
        self.core.store()
    }

    /// Registers an interceptor; it decorates every entry point
    /// installed afterwards. Last-registered ends up outermost.
    pub fn add_interceptor(&self, interceptor: Arc<dyn EntryPointInterceptor>) {
        self.core.interceptors.write().push(interceptor);
    }

    /// Typed capability lookup without a module guard; module code
    /// should prefer `Shell::get_api`.
    pub fn get_api<T>(&self, key: &ApiKey<T>) -> Result<Arc<T>, ApiError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.core.get_api(key)
    }

    pub fn get_slot<T>(&self, key: &SlotKey<T>) -> Result<Arc<ExtensionSlot<T>>, SlotError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.core.get_slot(key)
    }

    pub fn has_shell(&self, name: &str) -> bool {
        self.core.shells.read().iter().any(|s| s.name() == name)
    }

    pub fn is_lazy_entry_point(&self, name: &str) -> bool {
        self.core.lazy.read().contains(name)
    }

    pub fn all_slot_keys(&self) -> Vec<String> {
        self.core.slots.read().keys().cloned().collect()
    }

    pub fn all_entry_points(&self) -> Vec<EntryPointInfo> {
        let mut infos: Vec<EntryPointInfo> = self
            .core
            .shells
            .read()
            .iter()
            .map(|s| EntryPointInfo {
                name: s.name().to_owned(),
                lazy: false,
                attached: true,
            })
            .collect();
        infos.extend(self.core.lazy.read().iter().map(|name| EntryPointInfo {
            name: name.clone(),
            lazy: true,
            attached: false,
        }));
        infos
    }

    /// Registers a callback invoked with the installed shell names
    /// after every batch.
    pub fn on_shells_changed(&self, callback: impl Fn(&[String]) + Send + Sync + 'static) -> u64 {
        let id = self.core.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.core
            .shells_changed
            .write()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn remove_shells_changed_callback(&self, id: u64) {
        self.core
            .shells_changed
            .write()
            .retain(|(cb_id, _)| *cb_id != id);
    }

    /// Renders the main view: every active contribution, one failing
    /// item suppressed rather than propagated.
    pub fn render_main_view(&self) -> Vec<Fragment> {
        match self.core.get_slot(&MAIN_VIEW) {
            Ok(slot) => render_contributions(&slot, self.core.logger.as_ref()),
            Err(_) => Vec::new(),
        }
    }

    /// Installs a batch of shells.
    ///
    /// Dependency validation is total-or-nothing: a missing dependency,
    /// cycle, or layer violation aborts the whole batch before any
    /// attach hook runs. Hook failures are contained: the failing shell
    /// rolls back, its siblings install, and the failures are surfaced
    /// in the returned [`InstallError::Shells`].
    pub async fn add_shells(
        &self,
        descriptors: Vec<ShellDescriptor>,
    ) -> Result<(), InstallError> {
        let chain = self.core.interceptors.read().clone();
        let mut failures: Vec<ShellFailure> = Vec::new();
        let mut ready: Vec<Box<dyn EntryPoint>> = Vec::new();
        for descriptor in descriptors {
            match descriptor {
                ShellDescriptor::Ready(ep) => ready.push(apply_interceptors(ep, &chain)),
                ShellDescriptor::Lazy(lazy) => self.register_lazy(lazy, &mut failures),
            }
        }

        self.install_batch(ready, &mut failures)?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(InstallError::Shells(failures))
        }
    }

    /// Detaches the named shells in reverse-dependency order
    /// (dependents before their providers). Unknown names are logged
    /// and skipped; a pending lazy module is cancelled by removal.
    pub async fn remove_shells<S: AsRef<str>>(&self, names: &[S]) {
        let requested: HashSet<&str> = names.iter().map(AsRef::as_ref).collect();

        // Cancel pending lazy loads: the factory result will find the
        // name gone from the wanted set and discard itself.
        let mut cancelled: HashSet<&str> = HashSet::new();
        {
            let mut lazy = self.core.lazy.write();
            let mut wanted = self.core.wanted.write();
            for name in &requested {
                if lazy.remove(*name) {
                    wanted.remove(*name);
                    cancelled.insert(*name);
                    tracing::debug!(module = %name, "cancelled pending lazy entry point");
                }
            }
        }

        // Install order is topological, so its reverse detaches
        // dependents before the shells they depend on.
        let ordered: Vec<Shell> = self
            .core
            .shells
            .read()
            .iter()
            .filter(|s| requested.contains(s.name()))
            .rev()
            .cloned()
            .collect();

        for name in &requested {
            let known =
                cancelled.contains(*name) || ordered.iter().any(|s| s.name() == *name);
            if !known {
                tracing::warn!(module = %name, "remove_shells: no such shell");
            }
        }

        self.core.store.begin_batch();
        for shell in &ordered {
            self.detach_shell(shell);
        }
        self.core.store.end_batch();
        if !ordered.is_empty() {
            self.core.notify_shells_changed();
        }
    }

    /// Detaches everything, dependents first.
    pub async fn shutdown(&self) {
        let names = self.core.shell_names();
        self.remove_shells(&names).await;
    }

    fn detach_shell(&self, shell: &Shell) {
        shell.set_state(LifecycleState::Detaching);
        // Registrations go first so nothing dangles if the hook fails.
        self.core.sweep_module(shell.name());

        let span = self.core.logger.span_root(
            "shell.detach",
            &[("module", serde_json::Value::from(shell.name()))],
        );
        match shell.entry_point().detach(shell) {
            Ok(()) => span.end(true, None, &[]),
            Err(error) => {
                span.end(false, Some(&error), &[]);
                tracing::error!(module = shell.name(), error = %error, "detach hook failed");
            }
        }

        shell.set_lifecycle(false, false, false);
        shell.set_state(LifecycleState::Detached);
        self.core.shells.write().retain(|s| s.name() != shell.name());
        self.core.wanted.write().remove(shell.name());
        tracing::info!(module = shell.name(), "shell detached");
    }

    fn register_lazy(&self, lazy: LazyEntryPoint, failures: &mut Vec<ShellFailure>) {
        let name = lazy.name().to_owned();
        {
            let mut wanted = self.core.wanted.write();
            if wanted.contains(&name) {
                failures.push(ShellFailure {
                    module: name.clone(),
                    phase: InstallPhase::Registration,
                    source: ConfigurationError::DuplicateShell { module: name }.into(),
                });
                return;
            }
            wanted.insert(name.clone());
        }
        self.core.lazy.write().insert(name.clone());

        let host = self.clone();
        let (name, factory) = lazy.into_parts();
        tokio::spawn(async move {
            let result = factory().await;
            host.core.lazy.write().remove(&name);
            let still_wanted = host.core.wanted.write().remove(&name);
            match result {
                Ok(entry_point) if still_wanted => {
                    let chain = host.core.interceptors.read().clone();
                    let mut failures = Vec::new();
                    let outcome = host.install_batch(
                        vec![apply_interceptors(entry_point, &chain)],
                        &mut failures,
                    );
                    if let Err(error) = outcome {
                        tracing::error!(module = %name, error = %error, "lazy entry point failed dependency resolution");
                    }
                    for failure in failures {
                        tracing::error!(module = %failure.module, error = %failure.source, "lazy entry point failed to install");
                    }
                }
                Ok(_) => {
                    tracing::debug!(module = %name, "lazy entry point resolved after removal; discarded");
                }
                Err(error) => {
                    tracing::error!(module = %name, error = %error, "lazy entry point factory failed");
                }
            }
        });
    }

    /// Runs one batch of ready entry points through screen -> resolve ->
    /// attach -> extend, with one store notification at the end.
    fn install_batch(
        &self,
        entry_points: Vec<Box<dyn EntryPoint>>,
        failures: &mut Vec<ShellFailure>,
    ) -> Result<(), DependencyError> {
        // Duplicate names are configuration errors contained to the
        // offending descriptor.
        let mut accepted: Vec<Box<dyn EntryPoint>> = Vec::new();
        {
            let mut wanted = self.core.wanted.write();
            for ep in entry_points {
                let name = ep.name();
                if wanted.contains(&name) {
                    tracing::error!(module = %name, "duplicate shell name rejected");
                    failures.push(ShellFailure {
                        module: name.clone(),
                        phase: InstallPhase::Registration,
                        source: ConfigurationError::DuplicateShell { module: name }.into(),
                    });
                    continue;
                }
                wanted.insert(name);
                accepted.push(ep);
            }
        }
        if accepted.is_empty() {
            return Ok(());
        }

        let metas: Vec<BatchModule> = accepted
            .iter()
            .map(|ep| BatchModule {
                name: ep.name(),
                layer: ep.layer(),
                requires: ep.dependency_apis(),
                provides: ep.declared_apis(),
            })
            .collect();
        let installed: HashMap<String, InstalledProvider> = self
            .core
            .apis
            .read()
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    InstalledProvider {
                        module: entry.provider.to_string(),
                        layer: entry.layer.clone(),
                    },
                )
            })
            .collect();

        let plan = match resolve_order(
            &metas,
            &installed,
            self.core.layer_index.as_ref(),
            !self.core.options.disable_cycle_check,
        ) {
            Ok(plan) => plan,
            Err(error) => {
                // Fail-fast: none of the batch attaches.
                let mut wanted = self.core.wanted.write();
                for meta in &metas {
                    wanted.remove(&meta.name);
                }
                tracing::error!(error = %error, "shell batch failed dependency validation");
                return Err(error);
            }
        };

        for &idx in &plan.skipped {
            let name = &metas[idx].name;
            tracing::warn!(module = %name, "unresolvable with cycle check disabled; skipped");
            self.core.wanted.write().remove(name);
        }

        let mut pending: Vec<Option<Box<dyn EntryPoint>>> =
            accepted.into_iter().map(Some).collect();

        self.core.store.begin_batch();

        let mut attached: Vec<Shell> = Vec::new();
        for &idx in &plan.order {
            let Some(entry_point) = pending[idx].take() else {
                continue;
            };
            let shell = Shell::new(&self.core, entry_point);
            let deps_ok = self.core.deps_satisfied(shell.required());
            shell.set_lifecycle(deps_ok, deps_ok, false);
            shell.set_state(LifecycleState::Attaching);

            let span = self.core.logger.span_root(
                "shell.attach",
                &[("module", serde_json::Value::from(shell.name()))],
            );
            match shell.entry_point().attach(&shell) {
                Ok(()) => {
                    span.end(true, None, &[]);
                    shell.set_lifecycle(deps_ok, deps_ok, true);
                    shell.set_state(LifecycleState::Active);
                    self.core.shells.write().push(shell.clone());
                    attached.push(shell);
                }
                Err(error) => {
                    span.end(false, Some(&error), &[]);
                    tracing::error!(
                        module = shell.name(),
                        error = %error,
                        "attach hook failed; rolling back"
                    );
                    self.rollback_shell(&shell);
                    failures.push(ShellFailure {
                        module: shell.name().to_owned(),
                        phase: InstallPhase::Attach,
                        source: error,
                    });
                }
            }
        }

        // Cross-module extension runs only after the whole batch is
        // attached, so every dependency in the batch is satisfiable.
        for shell in &attached {
            let span = self.core.logger.span_root(
                "shell.extend",
                &[("module", serde_json::Value::from(shell.name()))],
            );
            match shell.entry_point().extend(shell) {
                Ok(()) => span.end(true, None, &[]),
                Err(error) => {
                    span.end(false, Some(&error), &[]);
                    tracing::error!(
                        module = shell.name(),
                        error = %error,
                        "extend hook failed; rolling back"
                    );
                    self.core.shells.write().retain(|s| s.name() != shell.name());
                    self.rollback_shell(shell);
                    failures.push(ShellFailure {
                        module: shell.name().to_owned(),
                        phase: InstallPhase::Extend,
                        source: error,
                    });
                }
            }
        }

        self.core.store.end_batch();
        self.core.notify_shells_changed();
        Ok(())
    }

    fn rollback_shell(&self, shell: &Shell) {
        self.core.sweep_module(shell.name());
        shell.set_lifecycle(false, false, false);
        shell.set_state(LifecycleState::Detached);
        self.core.wanted.write().remove(shell.name());
    }
}

impl Default for AppHost {
    fn default() -> Self {
        Self::new(HostOptions::default())
    }
}
