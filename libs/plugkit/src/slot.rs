//! Named, typed, multi-value extension points.
//!
//! A slot belongs to the shell that first declares it but accepts
//! contributions from any shell. Items keep a weak back-reference to
//! their contributing shell: retrieval filters out items whose shell is
//! no longer live, and a shell's detach sweeps its items out of every
//! slot. Every mutation bumps a slot-local revision counter and signals
//! the host store so bound units re-derive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::errors::SlotError;
use crate::shell::{Shell, WeakShell};

/// Read-time activation predicate for one item.
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// One contribution to a slot.
pub struct ExtensionItem<T> {
    name: Option<String>,
    module: Arc<str>,
    shell: WeakShell,
    contribution: T,
    condition: Option<Predicate>,
    unique_id: Uuid,
}

impl<T: std::fmt::Debug> std::fmt::Debug for ExtensionItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionItem")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("contribution", &self.contribution)
            .field("unique_id", &self.unique_id)
            .finish()
    }
}

impl<T: Clone> Clone for ExtensionItem<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            module: Arc::clone(&self.module),
            shell: self.shell.clone(),
            contribution: self.contribution.clone(),
            condition: self.condition.clone(),
            unique_id: self.unique_id,
        }
    }
}

impl<T> ExtensionItem<T> {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name of the contributing shell.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The contributing shell, while it is still installed.
    pub fn shell(&self) -> Option<Shell> {
        self.shell.upgrade()
    }

    pub fn contribution(&self) -> &T {
        &self.contribution
    }

    /// Evaluates the activation predicate; items without one are always
    /// active.
    pub fn condition_holds(&self) -> bool {
        self.condition.as_ref().map_or(true, |c| c())
    }

    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }
}

/// A typed extension slot. Obtained from `Shell::declare_slot` /
/// `get_slot`; always handled through an `Arc`.
pub struct ExtensionSlot<T> {
    name: String,
    declaring_module: Arc<str>,
    items: parking_lot::RwLock<Vec<ExtensionItem<T>>>,
    revision: AtomicU64,
    on_change: Arc<dyn Fn() + Send + Sync>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for ExtensionSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionSlot")
            .field("name", &self.name)
            .field("declaring_module", &self.declaring_module)
            .field("items", &self.items)
            .field("revision", &self.revision)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> ExtensionSlot<T> {
    pub(crate) fn new(
        name: String,
        declaring_module: Arc<str>,
        on_change: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            name,
            declaring_module,
            items: parking_lot::RwLock::new(Vec::new()),
            revision: AtomicU64::new(0),
            on_change,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the shell that declared this slot.
    pub fn declaring_module(&self) -> &str {
        &self.declaring_module
    }

    /// Counter bumped by every mutation; cheap change detection for
    /// memoized projections.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Appends an item. The returned handle removes exactly that item.
    pub fn contribute(
        self: &Arc<Self>,
        shell: &Shell,
        item: T,
        condition: Option<Predicate>,
    ) -> Contribution {
        self.insert(shell, None, item, condition)
    }

    /// Appends a named item, addressable via
    /// [`ExtensionSlot::get_item_by_name`].
    pub fn contribute_named(
        self: &Arc<Self>,
        shell: &Shell,
        name: &str,
        item: T,
        condition: Option<Predicate>,
    ) -> Contribution {
        self.insert(shell, Some(name.to_owned()), item, condition)
    }

    fn insert(
        self: &Arc<Self>,
        shell: &Shell,
        name: Option<String>,
        item: T,
        condition: Option<Predicate>,
    ) -> Contribution {
        let unique_id = Uuid::now_v7();
        self.items.write().push(ExtensionItem {
            name,
            module: shell.name_arc(),
            shell: shell.downgrade(),
            contribution: item,
            condition,
            unique_id,
        });
        self.bump();
        let erased: Arc<dyn ErasedSlot> = Arc::clone(self) as Arc<dyn ErasedSlot>;
        Contribution {
            slot: Arc::downgrade(&erased),
            id: unique_id,
            active: AtomicBool::new(true),
        }
    }

    /// Items from live shells, in contribution order. `force_all`
    /// bypasses the liveness filter; teardown sweeps use it to make
    /// sure no orphan survives.
    pub fn get_items(&self, force_all: bool) -> Vec<ExtensionItem<T>> {
        self.items
            .read()
            .iter()
            .filter(|item| force_all || item.shell.is_live())
            .cloned()
            .collect()
    }

    /// The single active item.
    pub fn get_single_item(&self) -> Result<ExtensionItem<T>, SlotError> {
        let mut items = self.get_items(false).into_iter();
        match (items.next(), items.next()) {
            (None, _) => Err(SlotError::Empty {
                key: self.name.clone(),
            }),
            (Some(item), None) => Ok(item),
            (Some(_), Some(_)) => Err(SlotError::Ambiguous {
                key: self.name.clone(),
                count: 2 + items.count(),
            }),
        }
    }

    /// The first active item contributed under `name`.
    pub fn get_item_by_name(&self, name: &str) -> Result<ExtensionItem<T>, SlotError> {
        self.get_items(false)
            .into_iter()
            .find(|item| item.name() == Some(name))
            .ok_or_else(|| SlotError::ItemNotFound {
                key: self.name.clone(),
                name: name.to_owned(),
            })
    }

    /// Removes every item matching `predicate`, regardless of owner.
    pub fn discard_by(&self, predicate: impl Fn(&ExtensionItem<T>) -> bool) {
        let removed = {
            let mut items = self.items.write();
            let before = items.len();
            items.retain(|item| !predicate(item));
            before != items.len()
        };
        if removed {
            self.bump();
        }
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
        (self.on_change)();
    }
}

/// Slot operations that do not depend on the item type; the host uses
/// these for teardown sweeps.
pub(crate) trait ErasedSlot: Send + Sync {
    fn remove_item(&self, id: Uuid) -> bool;
    fn discard_module(&self, module: &str);
}

impl<T: Clone + Send + Sync + 'static> ErasedSlot for ExtensionSlot<T> {
    fn remove_item(&self, id: Uuid) -> bool {
        let removed = {
            let mut items = self.items.write();
            let before = items.len();
            items.retain(|item| item.unique_id != id);
            before != items.len()
        };
        if removed {
            self.bump();
        }
        removed
    }

    fn discard_module(&self, module: &str) {
        self.discard_by(|item| item.module() == module);
    }
}

/// Handle for one contributed item; `unsubscribe` removes exactly that
/// item and is idempotent.
pub struct Contribution {
    slot: Weak<dyn ErasedSlot>,
    id: Uuid,
    active: AtomicBool,
}

impl Contribution {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(slot) = self.slot.upgrade() {
                slot.remove_item(self.id);
            }
        }
    }
}

/// Storage strategy behind a custom slot. The handler owns the
/// contributed items; the host only routes contributions and teardown
/// sweeps through it.
pub trait CustomSlotHandler<T>: Send + Sync + 'static {
    fn contribute(&self, module: &str, item: T, condition: Option<Predicate>);

    /// Drops whatever the handler stored for `module`; invoked by the
    /// host when that module detaches.
    fn discard_module(&self, module: &str);
}

/// A slot whose contributions are routed to a caller-supplied handler
/// instead of the host's ordered item list. Declared through
/// `Shell::declare_custom_slot`; module detach still sweeps it.
pub struct CustomExtensionSlot<T> {
    name: String,
    declaring_module: Arc<str>,
    handler: Arc<dyn CustomSlotHandler<T>>,
    on_change: Arc<dyn Fn() + Send + Sync>,
}

impl<T: Send + Sync + 'static> CustomExtensionSlot<T> {
    pub(crate) fn new(
        name: String,
        declaring_module: Arc<str>,
        handler: Arc<dyn CustomSlotHandler<T>>,
        on_change: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            name,
            declaring_module,
            handler,
            on_change,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declaring_module(&self) -> &str {
        &self.declaring_module
    }

    pub fn contribute(&self, shell: &Shell, item: T, condition: Option<Predicate>) {
        self.handler.contribute(shell.name(), item, condition);
        (self.on_change)();
    }
}

impl<T: Send + Sync + 'static> ErasedSlot for CustomExtensionSlot<T> {
    fn remove_item(&self, _id: Uuid) -> bool {
        // Item identity lives inside the handler; nothing to do here.
        false
    }

    fn discard_module(&self, module: &str) {
        self.handler.discard_module(module);
        (self.on_change)();
    }
}
