//! The per-module facade.
//!
//! A [`Shell`] is the explicit handle through which one installed
//! module reaches the host: capability lookup, slot declaration and
//! contribution, state sections, dispatch, memoization, logging, and
//! typed configuration. Every operation that needs module identity goes
//! through this handle; nothing is resolved ambiently.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::api::{ApiKey, Dependency, SlotKey};
use crate::config::{module_config_or_default, module_config_required};
use crate::contracts::{EntryPoint, Tags};
use crate::errors::{HostError, LifecycleError};
use crate::host::HostCore;
use crate::logging::ShellLogger;
use crate::memoize::{FlushableCache, Memoized};
use crate::render::{ViewFactory, MAIN_VIEW};
use crate::slot::{Contribution, CustomExtensionSlot, CustomSlotHandler, ExtensionSlot};
use crate::store::{Action, Subscription};

/// Where a module is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Pending,
    Attaching,
    Active,
    Detaching,
    Detached,
}

pub(crate) struct ShellInner {
    name: Arc<str>,
    tags: Tags,
    layer: Option<String>,
    entry_point: Box<dyn EntryPoint>,
    required: Vec<Dependency>,
    host: Weak<HostCore>,
    state: RwLock<LifecycleState>,
    can_use_apis: AtomicBool,
    can_use_store: AtomicBool,
    init_completed: AtomicBool,
    logger: ShellLogger,
    caches: Mutex<Vec<Arc<dyn FlushableCache>>>,
}

/// Cheap-clone handle to one installed module.
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

/// Weak back-reference held by extension items.
#[derive(Clone)]
pub(crate) struct WeakShell {
    inner: Weak<ShellInner>,
}

impl WeakShell {
    pub(crate) fn upgrade(&self) -> Option<Shell> {
        self.inner.upgrade().map(|inner| Shell { inner })
    }

    /// Live means the shell is attaching or active; anything else (or a
    /// dropped shell) filters the item out of slot retrieval.
    pub(crate) fn is_live(&self) -> bool {
        self.upgrade().map_or(false, |shell| {
            matches!(
                shell.state(),
                LifecycleState::Attaching | LifecycleState::Active
            )
        })
    }
}

impl Shell {
    pub(crate) fn new(host: &Arc<HostCore>, entry_point: Box<dyn EntryPoint>) -> Self {
        let name: Arc<str> = Arc::from(entry_point.name().as_str());
        let logger = ShellLogger::new(host.logger(), Arc::clone(&name), host.monitoring());
        Self {
            inner: Arc::new(ShellInner {
                tags: entry_point.tags(),
                layer: entry_point.layer(),
                required: entry_point.dependency_apis(),
                name,
                entry_point,
                host: Arc::downgrade(host),
                state: RwLock::new(LifecycleState::Pending),
                can_use_apis: AtomicBool::new(false),
                can_use_store: AtomicBool::new(false),
                init_completed: AtomicBool::new(false),
                logger,
                caches: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn tags(&self) -> &Tags {
        &self.inner.tags
    }

    pub fn layer(&self) -> Option<&str> {
        self.inner.layer.as_deref()
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.read()
    }

    pub fn can_use_apis(&self) -> bool {
        self.inner.can_use_apis.load(Ordering::Acquire)
    }

    pub fn can_use_store(&self) -> bool {
        self.inner.can_use_store.load(Ordering::Acquire)
    }

    pub fn was_initialization_completed(&self) -> bool {
        self.inner.init_completed.load(Ordering::Acquire)
    }

    /// Module-scoped logger; every record carries the module name.
    pub fn log(&self) -> &ShellLogger {
        &self.inner.logger
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.inner.name)
    }

    pub(crate) fn downgrade(&self) -> WeakShell {
        WeakShell {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn entry_point(&self) -> &dyn EntryPoint {
        self.inner.entry_point.as_ref()
    }

    pub(crate) fn required(&self) -> &[Dependency] {
        &self.inner.required
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        *self.inner.state.write() = state;
    }

    pub(crate) fn set_lifecycle(&self, store: bool, apis: bool, init_completed: bool) {
        self.inner.can_use_store.store(store, Ordering::Release);
        self.inner.can_use_apis.store(apis, Ordering::Release);
        self.inner
            .init_completed
            .store(init_completed, Ordering::Release);
    }

    pub(crate) fn core(&self) -> Result<Arc<HostCore>, LifecycleError> {
        self.inner.host.upgrade().ok_or_else(|| LifecycleError::Detached {
            module: self.name().to_owned(),
        })
    }

    /// Typed capability lookup, guarded by this module's lifecycle:
    /// fails fast until the module's own dependencies are satisfied.
    pub fn get_api<T>(&self, key: &ApiKey<T>) -> Result<Arc<T>, HostError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if self.state() == LifecycleState::Detached {
            return Err(LifecycleError::Detached {
                module: self.name().to_owned(),
            }
            .into());
        }
        if !self.can_use_apis() {
            return Err(LifecycleError::ApisNotReady {
                module: self.name().to_owned(),
                key: key.name().to_owned(),
            }
            .into());
        }
        Ok(self.core()?.get_api(key)?)
    }

    /// Registers a capability under `key`. The registration is removed
    /// when this module detaches; duplicate keys are rejected at once.
    pub fn contribute_api<T>(&self, key: &ApiKey<T>, api: Arc<T>) -> Result<(), HostError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let core = self.core()?;
        core.register_api(&self.name_arc(), self.layer(), key, api)?;
        Ok(())
    }

    /// Creates (or idempotently retrieves) the slot for `key`.
    pub fn declare_slot<T>(&self, key: &SlotKey<T>) -> Result<Arc<ExtensionSlot<T>>, HostError>
    where
        T: Clone + Send + Sync + 'static,
    {
        Ok(self.core()?.declare_slot(&self.name_arc(), key)?)
    }

    pub fn get_slot<T>(&self, key: &SlotKey<T>) -> Result<Arc<ExtensionSlot<T>>, HostError>
    where
        T: Clone + Send + Sync + 'static,
    {
        Ok(self.core()?.get_slot(key)?)
    }

    /// Declares a slot whose contributions are routed to `handler`
    /// instead of the host's ordered item list.
    pub fn declare_custom_slot<T>(
        &self,
        key: &SlotKey<T>,
        handler: Arc<dyn CustomSlotHandler<T>>,
    ) -> Result<Arc<CustomExtensionSlot<T>>, HostError>
    where
        T: Send + Sync + 'static,
    {
        Ok(self
            .core()?
            .declare_custom_slot(&self.name_arc(), key, handler)?)
    }

    /// Contributes a typed state section plus its reducer to the
    /// aggregated store.
    pub fn contribute_state<S>(
        &self,
        section: &str,
        initial: S,
        reducer: impl Fn(&mut S, &Action) + Send + Sync + 'static,
    ) -> Result<(), HostError>
    where
        S: Send + Sync + 'static,
    {
        let core = self.core()?;
        core.store()
            .register_section(&self.name_arc(), section, initial, reducer)?;
        Ok(())
    }

    /// Contributes a renderable fragment factory to the host's main
    /// view slot.
    pub fn contribute_main_view(&self, factory: ViewFactory) -> Result<Contribution, HostError> {
        let slot = self.get_slot(&MAIN_VIEW)?;
        Ok(slot.contribute(self, factory, None))
    }

    /// The store scoped to this module; reads and dispatch are
    /// lifecycle-guarded at call time.
    pub fn scoped_store(&self) -> ScopedStore {
        ScopedStore {
            shell: self.clone(),
        }
    }

    /// Memoizes `func` keyed by `resolver` over its arguments. Honors
    /// the host's `disable_memoization` and `debug_memoization`
    /// switches.
    pub fn memoize<A, K, O>(
        &self,
        name: &str,
        func: impl Fn(&A) -> O + Send + Sync + 'static,
        resolver: impl Fn(&A) -> K + Send + Sync + 'static,
    ) -> Arc<Memoized<A, K, O>>
    where
        A: Send + Sync + 'static,
        K: Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let monitoring = self
            .inner
            .host
            .upgrade()
            .map(|core| core.monitoring())
            .unwrap_or_default();
        Arc::new(Memoized::new(
            format!("{}.{name}", self.name()),
            func,
            resolver,
            None,
            !monitoring.disable_memoization,
            monitoring.debug_memoization,
        ))
    }

    /// Like [`Shell::memoize`], but the cache is also invalidated by
    /// state changes: `should_clear` is consulted before every call
    /// (defaulting to a store-generation watcher), and the cache is
    /// registered for [`Shell::flush_memoized_for_state`] sweeps.
    pub fn memoize_for_state<A, K, O>(
        &self,
        name: &str,
        func: impl Fn(&A) -> O + Send + Sync + 'static,
        resolver: impl Fn(&A) -> K + Send + Sync + 'static,
        should_clear: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    ) -> Arc<Memoized<A, K, O>>
    where
        A: Send + Sync + 'static,
        K: Eq + Hash + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let monitoring = self
            .inner
            .host
            .upgrade()
            .map(|core| core.monitoring())
            .unwrap_or_default();
        let should_clear = should_clear.unwrap_or_else(|| self.generation_watcher());
        let memo = Arc::new(Memoized::new(
            format!("{}.{name}", self.name()),
            func,
            resolver,
            Some(should_clear),
            !monitoring.disable_memoization,
            monitoring.debug_memoization,
        ));
        self.inner
            .caches
            .lock()
            .push(Arc::clone(&memo) as Arc<dyn FlushableCache>);
        memo
    }

    /// Clears every state-bound cache of this module.
    pub fn flush_memoized_for_state(&self) {
        for cache in self.inner.caches.lock().iter() {
            cache.flush();
        }
    }

    /// Fires when the store generation advanced since the previous
    /// probe.
    fn generation_watcher(&self) -> Box<dyn Fn() -> bool + Send + Sync> {
        let host = self.inner.host.clone();
        let last_seen = AtomicU64::new(
            host.upgrade()
                .map(|core| core.store().generation())
                .unwrap_or(0),
        );
        Box::new(move || {
            let Some(core) = host.upgrade() else {
                return false;
            };
            let generation = core.store().generation();
            last_seen.swap(generation, Ordering::AcqRel) != generation
        })
    }

    /// Typed module configuration; missing sections become defaults.
    pub fn config<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T, HostError> {
        let core = self.core()?;
        Ok(module_config_or_default(
            core.config_provider().as_ref(),
            self.name(),
        )?)
    }

    /// Typed module configuration; the section must exist.
    pub fn config_required<T: serde::de::DeserializeOwned>(&self) -> Result<T, HostError> {
        let core = self.core()?;
        Ok(module_config_required(
            core.config_provider().as_ref(),
            self.name(),
        )?)
    }
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Dispatch/read/subscribe/flush, scoped to one module and guarded by
/// its lifecycle flags.
#[derive(Clone)]
pub struct ScopedStore {
    shell: Shell,
}

impl ScopedStore {
    fn guarded(&self) -> Result<Arc<crate::store::ThrottledStore>, HostError> {
        if self.shell.state() == LifecycleState::Detached {
            return Err(LifecycleError::Detached {
                module: self.shell.name().to_owned(),
            }
            .into());
        }
        if !self.shell.can_use_store() {
            return Err(LifecycleError::StoreNotReady {
                module: self.shell.name().to_owned(),
            }
            .into());
        }
        Ok(self.shell.core()?.store())
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn dispatch(&self, action: &Action) -> Result<(), HostError> {
        self.guarded()?.dispatch(action);
        Ok(())
    }

    pub fn with_state<S: 'static, R>(
        &self,
        section: &str,
        f: impl FnOnce(&S) -> R,
    ) -> Result<R, HostError> {
        Ok(self.guarded()?.with_state(section, f)?)
    }

    pub fn state<S: Clone + 'static>(&self, section: &str) -> Result<S, HostError> {
        Ok(self.guarded()?.state(section)?)
    }

    pub fn subscribe(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Result<Subscription, HostError> {
        Ok(self.guarded()?.subscribe(listener))
    }

    pub fn flush(&self) -> Result<(), HostError> {
        self.guarded()?.flush();
        Ok(())
    }

    pub fn generation(&self) -> Result<u64, HostError> {
        Ok(self.guarded()?.generation())
    }
}
