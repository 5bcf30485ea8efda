//! Typed keys for capabilities and extension slots.
//!
//! A key carries a globally unique name plus a compile-time type marker,
//! so lookups downcast to the exact registered type. Keys are
//! `const`-constructible; modules declare them as statics next to the
//! trait they identify:
//!
//! ```
//! use plugkit::api::ApiKey;
//!
//! pub trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! pub const GREETER: ApiKey<dyn Greeter> = ApiKey::new("demo.greeter");
//! ```

use std::fmt;
use std::marker::PhantomData;

/// Typed capability key. `T` is usually a trait object
/// (`dyn my_module::Api`); the value registered under the key is an
/// `Arc<T>`.
pub struct ApiKey<T: ?Sized> {
    name: &'static str,
    layer: Option<&'static str>,
    version: Option<u32>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: ?Sized> ApiKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            layer: None,
            version: None,
            _marker: PhantomData,
        }
    }

    /// Key whose provider is pinned to a layer, overriding the
    /// provider module's own layer during validation.
    pub const fn in_layer(name: &'static str, layer: &'static str) -> Self {
        Self {
            name,
            layer: Some(layer),
            version: None,
            _marker: PhantomData,
        }
    }

    pub const fn with_version(self, version: u32) -> Self {
        Self {
            name: self.name,
            layer: self.layer,
            version: Some(version),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn layer(&self) -> Option<&'static str> {
        self.layer
    }

    #[inline]
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Untyped projection used in entry-point declarations.
    pub fn erased(&self) -> AnyApiKey {
        AnyApiKey {
            name: self.name,
            layer: self.layer,
            version: self.version,
        }
    }

    /// A hard dependency declaration on this key.
    pub fn required(&self) -> Dependency {
        Dependency {
            key: self.erased(),
            optional: false,
        }
    }

    /// A dependency declaration that resolution may leave unsatisfied.
    pub fn optional(&self) -> Dependency {
        Dependency {
            key: self.erased(),
            optional: true,
        }
    }
}

impl<T: ?Sized> Clone for ApiKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: ?Sized> Copy for ApiKey<T> {}

impl<T: ?Sized> fmt::Debug for ApiKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("name", &self.name)
            .field("layer", &self.layer)
            .field("version", &self.version)
            .finish()
    }
}

/// Untyped capability key, as it appears in entry-point metadata and
/// resolver input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AnyApiKey {
    pub name: &'static str,
    pub layer: Option<&'static str>,
    pub version: Option<u32>,
}

impl fmt::Display for AnyApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// One declared dependency of an entry point.
#[derive(Clone, Copy, Debug)]
pub struct Dependency {
    pub key: AnyApiKey,
    pub optional: bool,
}

/// Typed extension slot key. `T` is the item type the slot holds.
pub struct SlotKey<T> {
    name: &'static str,
    _marker: PhantomData<fn(&T)>,
}

impl<T> SlotKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for SlotKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SlotKey<T> {}

impl<T> fmt::Debug for SlotKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotKey").field("name", &self.name).finish()
    }
}
