//! Entry points: the static (or lazy) declaration of a module.
//!
//! An entry point names the module, declares the APIs it provides and
//! consumes, and carries the attach/extend/detach hooks the host drives
//! in resolved order. Interceptors decorate entry points at
//! registration time.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use std::sync::Arc;

use crate::api::{AnyApiKey, Dependency};
use crate::shell::Shell;

/// Free-form labels attached to an entry point; bulk operations select
/// on them.
pub type Tags = HashMap<String, String>;

/// One installable module declaration.
///
/// All hooks default to no-ops; implement only what the module needs.
/// Hooks take the module's own [`Shell`] explicitly — there is no
/// ambient "current module".
pub trait EntryPoint: Send + Sync + 'static {
    fn name(&self) -> String;

    fn tags(&self) -> Tags {
        Tags::new()
    }

    /// Layer this module lives in, when the host validates layering.
    fn layer(&self) -> Option<String> {
        None
    }

    /// APIs this module reads.
    fn dependency_apis(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// APIs this module will provide during attach.
    fn declared_apis(&self) -> Vec<AnyApiKey> {
        Vec::new()
    }

    /// Runs while the module is attaching; registrations made here are
    /// rolled back if the hook fails.
    fn attach(&self, shell: &Shell) -> anyhow::Result<()> {
        let _ = shell;
        Ok(())
    }

    /// Runs after every module in the installation batch attached.
    fn extend(&self, shell: &Shell) -> anyhow::Result<()> {
        let _ = shell;
        Ok(())
    }

    /// Runs during detach, after the module's registrations were
    /// unregistered.
    fn detach(&self, shell: &Shell) -> anyhow::Result<()> {
        let _ = shell;
        Ok(())
    }
}

type LazyFactory = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Box<dyn EntryPoint>>> + Send>;

/// A module whose real entry point resolves asynchronously on demand.
pub struct LazyEntryPoint {
    name: String,
    factory: LazyFactory,
}

impl LazyEntryPoint {
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Box<dyn EntryPoint>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(move || Box::pin(factory())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (String, LazyFactory) {
        (self.name, self.factory)
    }
}

/// What `add_shells` accepts: a ready entry point or a lazy one.
pub enum ShellDescriptor {
    Ready(Box<dyn EntryPoint>),
    Lazy(LazyEntryPoint),
}

impl ShellDescriptor {
    pub fn ready(entry_point: impl EntryPoint) -> Self {
        ShellDescriptor::Ready(Box::new(entry_point))
    }

    pub fn name(&self) -> String {
        match self {
            ShellDescriptor::Ready(ep) => ep.name(),
            ShellDescriptor::Lazy(lazy) => lazy.name().to_owned(),
        }
    }
}

impl From<Box<dyn EntryPoint>> for ShellDescriptor {
    fn from(ep: Box<dyn EntryPoint>) -> Self {
        ShellDescriptor::Ready(ep)
    }
}

impl From<LazyEntryPoint> for ShellDescriptor {
    fn from(lazy: LazyEntryPoint) -> Self {
        ShellDescriptor::Lazy(lazy)
    }
}

/// Introspection record for one known module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointInfo {
    pub name: String,
    pub lazy: bool,
    pub attached: bool,
}

type Hook = Box<dyn Fn(&Shell) -> anyhow::Result<()> + Send + Sync>;

/// Closure-based [`EntryPoint`], for modules that don't warrant a
/// dedicated type (and for tests).
#[derive(Default)]
pub struct EntryPointDef {
    name: String,
    tags: Tags,
    layer: Option<String>,
    dependencies: Vec<Dependency>,
    apis: Vec<AnyApiKey>,
    attach: Option<Hook>,
    extend: Option<Hook>,
    detach: Option<Hook>,
}

impl EntryPointDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn in_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn requires(mut self, dependencies: impl IntoIterator<Item = Dependency>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn provides(mut self, apis: impl IntoIterator<Item = AnyApiKey>) -> Self {
        self.apis.extend(apis);
        self
    }

    pub fn on_attach(mut self, f: impl Fn(&Shell) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.attach = Some(Box::new(f));
        self
    }

    pub fn on_extend(mut self, f: impl Fn(&Shell) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.extend = Some(Box::new(f));
        self
    }

    pub fn on_detach(mut self, f: impl Fn(&Shell) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.detach = Some(Box::new(f));
        self
    }
}

impl EntryPoint for EntryPointDef {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn tags(&self) -> Tags {
        self.tags.clone()
    }

    fn layer(&self) -> Option<String> {
        self.layer.clone()
    }

    fn dependency_apis(&self) -> Vec<Dependency> {
        self.dependencies.clone()
    }

    fn declared_apis(&self) -> Vec<AnyApiKey> {
        self.apis.clone()
    }

    fn attach(&self, shell: &Shell) -> anyhow::Result<()> {
        match &self.attach {
            Some(f) => f(shell),
            None => Ok(()),
        }
    }

    fn extend(&self, shell: &Shell) -> anyhow::Result<()> {
        match &self.extend {
            Some(f) => f(shell),
            None => Ok(()),
        }
    }

    fn detach(&self, shell: &Shell) -> anyhow::Result<()> {
        match &self.detach {
            Some(f) => f(shell),
            None => Ok(()),
        }
    }
}

/// Decorates entry points before installation. Every method defaults to
/// pass-through; hook interceptors receive the inner entry point and
/// decide whether and how to delegate.
pub trait EntryPointInterceptor: Send + Sync + 'static {
    fn intercept_name(&self, inner: String) -> String {
        inner
    }

    fn intercept_tags(&self, inner: Tags) -> Tags {
        inner
    }

    fn intercept_layer(&self, inner: Option<String>) -> Option<String> {
        inner
    }

    fn intercept_dependency_apis(&self, inner: Vec<Dependency>) -> Vec<Dependency> {
        inner
    }

    fn intercept_declared_apis(&self, inner: Vec<AnyApiKey>) -> Vec<AnyApiKey> {
        inner
    }

    fn intercept_attach(&self, inner: &dyn EntryPoint, shell: &Shell) -> anyhow::Result<()> {
        inner.attach(shell)
    }

    fn intercept_extend(&self, inner: &dyn EntryPoint, shell: &Shell) -> anyhow::Result<()> {
        inner.extend(shell)
    }

    fn intercept_detach(&self, inner: &dyn EntryPoint, shell: &Shell) -> anyhow::Result<()> {
        inner.detach(shell)
    }
}

struct Intercepted {
    inner: Box<dyn EntryPoint>,
    interceptor: Arc<dyn EntryPointInterceptor>,
}

impl EntryPoint for Intercepted {
    fn name(&self) -> String {
        self.interceptor.intercept_name(self.inner.name())
    }

    fn tags(&self) -> Tags {
        self.interceptor.intercept_tags(self.inner.tags())
    }

    fn layer(&self) -> Option<String> {
        self.interceptor.intercept_layer(self.inner.layer())
    }

    fn dependency_apis(&self) -> Vec<Dependency> {
        self.interceptor
            .intercept_dependency_apis(self.inner.dependency_apis())
    }

    fn declared_apis(&self) -> Vec<AnyApiKey> {
        self.interceptor
            .intercept_declared_apis(self.inner.declared_apis())
    }

    fn attach(&self, shell: &Shell) -> anyhow::Result<()> {
        self.interceptor.intercept_attach(self.inner.as_ref(), shell)
    }

    fn extend(&self, shell: &Shell) -> anyhow::Result<()> {
        self.interceptor.intercept_extend(self.inner.as_ref(), shell)
    }

    fn detach(&self, shell: &Shell) -> anyhow::Result<()> {
        self.interceptor.intercept_detach(self.inner.as_ref(), shell)
    }
}

/// Folds the interceptor chain over an entry point. The chain is
/// applied in registration order, so the last-registered interceptor
/// ends up outermost.
pub fn apply_interceptors(
    entry_point: Box<dyn EntryPoint>,
    chain: &[Arc<dyn EntryPointInterceptor>],
) -> Box<dyn EntryPoint> {
    chain.iter().fold(entry_point, |inner, interceptor| {
        Box::new(Intercepted {
            inner,
            interceptor: Arc::clone(interceptor),
        })
    })
}
