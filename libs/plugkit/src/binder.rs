//! Scoped data binding: connects a renderable unit to a derived
//! projection of shared state plus module-scoped dispatch.
//!
//! The projection is recomputed on store notifications and the change
//! callback fires only when the *derived* output actually differs,
//! judged by a pluggable equality strategy. The default is `PartialEq`
//! over the whole projection: an O(size) deep comparison, traded
//! deliberately for correctness over reference-identity checks. Every
//! projection invocation runs inside a monitoring span so slow or
//! failing derivations are observable without instrumenting modules.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ViolationPolicy;
use crate::errors::{HostError, LifecycleError};
use crate::shell::{ScopedStore, Shell};
use crate::store::Subscription;

/// Equality strategy over derived projections.
pub type EqualityFn<P> = Arc<dyn Fn(&P, &P) -> bool + Send + Sync>;

/// Options for one binding.
pub struct BindingOptions<P> {
    /// Suppress the lifecycle check for bindings created dynamically
    /// outside attach/extend.
    pub allow_out_of_lifecycle: bool,
    /// Custom comparison; defaults to `PartialEq` on the projection.
    pub equality: Option<EqualityFn<P>>,
}

impl<P> Default for BindingOptions<P> {
    fn default() -> Self {
        Self {
            allow_out_of_lifecycle: false,
            equality: None,
        }
    }
}

/// A live binding. Dropping it (or calling [`StateBinding::unbind`])
/// unsubscribes from the store exactly once.
pub struct StateBinding<P, D = ()> {
    shell: Shell,
    props: Arc<RwLock<Arc<P>>>,
    dispatch_props: D,
    subscription: Subscription,
}

impl<P, D: std::fmt::Debug> std::fmt::Debug for StateBinding<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBinding")
            .field("shell", &self.shell)
            .field("dispatch_props", &self.dispatch_props)
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl<P, D> StateBinding<P, D> {
    /// The most recently derived projection.
    pub fn props(&self) -> Arc<P> {
        Arc::clone(&self.props.read())
    }

    /// Dispatch-side projection, computed once at bind time.
    pub fn dispatch_props(&self) -> &D {
        &self.dispatch_props
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn unbind(&self) {
        self.subscription.unsubscribe();
    }
}

/// Binds a unit's inputs to a state projection and a dispatch
/// projection, both invoked with the owning shell as first argument.
///
/// Creating a binding after the shell finished initializing is a
/// lifecycle violation; the host's policy decides whether that warns or
/// fails, and `allow_out_of_lifecycle` opts a deliberate dynamic
/// binding out of the check.
pub fn bind_with_shell<P, D, FS, FD, C>(
    shell: &Shell,
    map_state: FS,
    map_dispatch: FD,
    on_change: C,
    options: BindingOptions<P>,
) -> Result<StateBinding<P, D>, HostError>
where
    P: PartialEq + Send + Sync + 'static,
    FS: Fn(&Shell, &ScopedStore) -> P + Send + Sync + 'static,
    FD: FnOnce(&Shell, &ScopedStore) -> D,
    C: Fn(&P) + Send + Sync + 'static,
{
    if shell.was_initialization_completed() && !options.allow_out_of_lifecycle {
        let policy = shell
            .core()
            .map(|core| core.lifecycle_violation())
            .unwrap_or_default();
        match policy {
            ViolationPolicy::Warn => shell.log().warning(
                "binding.out_of_lifecycle",
                &[(
                    "hint",
                    serde_json::Value::from(
                        "bind from attach() or extend(), or set allow_out_of_lifecycle",
                    ),
                )],
            ),
            ViolationPolicy::Fail => {
                return Err(LifecycleError::OutOfLifecycle {
                    module: shell.name().to_owned(),
                }
                .into())
            }
        }
    }

    let scoped = shell.scoped_store();
    let initial = shell
        .log()
        .monitor("binding.map_state", &[], || map_state(shell, &scoped));
    let dispatch_props = shell
        .log()
        .monitor("binding.map_dispatch", &[], || map_dispatch(shell, &scoped));

    let props = Arc::new(RwLock::new(Arc::new(initial)));
    let equality: EqualityFn<P> = options
        .equality
        .unwrap_or_else(|| Arc::new(|a: &P, b: &P| a == b));

    let sub_shell = shell.clone();
    let sub_scoped = scoped.clone();
    let sub_props = Arc::clone(&props);
    let on_change = Arc::new(on_change);
    let subscription = scoped.subscribe(move || {
        let next = sub_shell
            .log()
            .monitor("binding.map_state", &[], || map_state(&sub_shell, &sub_scoped));
        let changed = !equality(sub_props.read().as_ref(), &next);
        if changed {
            let next = Arc::new(next);
            *sub_props.write() = Arc::clone(&next);
            on_change(&next);
        }
    })?;

    Ok(StateBinding {
        shell: shell.clone(),
        props,
        dispatch_props,
        subscription,
    })
}
