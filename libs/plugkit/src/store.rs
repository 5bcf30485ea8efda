//! Aggregated application store with throttled notifications.
//!
//! Each shell contributes typed state sections with a reducer; the
//! store applies every dispatched action to every section. Listener
//! notifications are coalesced while an installation batch is open so
//! bound units never observe a partially-installed registry; `flush()`
//! is the synchronous escape hatch.
//!
//! Reads are side-effect free and reducers must not dispatch
//! reentrantly; the host runs all mutation on one logical thread.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::errors::{ConfigurationError, StoreError};

/// One dispatched action: a kind tag plus an opaque typed payload.
pub struct Action {
    kind: &'static str,
    payload: Box<dyn Any + Send + Sync>,
}

impl Action {
    pub fn new<P: Any + Send + Sync>(kind: &'static str, payload: P) -> Self {
        Self {
            kind,
            payload: Box::new(payload),
        }
    }

    /// An action with no payload.
    pub fn bare(kind: &'static str) -> Self {
        Self::new(kind, ())
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Typed view of the payload; `None` when `P` is not the payload
    /// type, so reducers can ignore actions that are not theirs.
    pub fn payload<P: Any>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }
}

type ErasedState = Box<dyn Any + Send + Sync>;
type ErasedReducer = Box<dyn Fn(&mut (dyn Any + Send + Sync), &Action) + Send + Sync>;

struct Section {
    owner: Arc<str>,
    state: ErasedState,
    reducer: ErasedReducer,
}

type Listener = Arc<dyn Fn() + Send + Sync>;

/// The aggregated store. Owned by the host; shells reach it through
/// their scoped handle.
pub struct ThrottledStore {
    sections: RwLock<HashMap<String, Section>>,
    subscribers: RwLock<Vec<(u64, Listener)>>,
    next_subscriber: AtomicU64,
    generation: AtomicU64,
    dirty: AtomicBool,
    batch_depth: AtomicU32,
}

impl ThrottledStore {
    pub(crate) fn new() -> Self {
        Self {
            sections: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            batch_depth: AtomicU32::new(0),
        }
    }

    pub(crate) fn register_section<S: Send + Sync + 'static>(
        &self,
        owner: &Arc<str>,
        name: &str,
        initial: S,
        reducer: impl Fn(&mut S, &Action) + Send + Sync + 'static,
    ) -> Result<(), ConfigurationError> {
        let mut sections = self.sections.write();
        if let Some(existing) = sections.get(name) {
            return Err(ConfigurationError::DuplicateStateSection {
                section: name.to_owned(),
                existing: existing.owner.to_string(),
            });
        }
        let erased: ErasedReducer = Box::new(move |state, action| {
            if let Some(state) = state.downcast_mut::<S>() {
                reducer(state, action);
            }
        });
        sections.insert(
            name.to_owned(),
            Section {
                owner: Arc::clone(owner),
                state: Box::new(initial),
                reducer: erased,
            },
        );
        drop(sections);
        self.signal_change();
        Ok(())
    }

    pub(crate) fn remove_sections_of(&self, owner: &str) {
        let mut sections = self.sections.write();
        let before = sections.len();
        sections.retain(|_, s| s.owner.as_ref() != owner);
        let removed = before != sections.len();
        drop(sections);
        if removed {
            self.signal_change();
        }
    }

    /// Applies `action` to every section, then notifies (or defers to
    /// the enclosing batch).
    pub fn dispatch(&self, action: &Action) {
        {
            let mut sections = self.sections.write();
            for section in sections.values_mut() {
                (section.reducer)(section.state.as_mut(), action);
            }
        }
        self.signal_change();
    }

    /// Runs `f` against the section's current state.
    pub fn with_state<S: 'static, R>(
        &self,
        section: &str,
        f: impl FnOnce(&S) -> R,
    ) -> Result<R, StoreError> {
        let sections = self.sections.read();
        let entry = sections
            .get(section)
            .ok_or_else(|| StoreError::SectionNotFound {
                section: section.to_owned(),
            })?;
        let state =
            entry
                .state
                .downcast_ref::<S>()
                .ok_or_else(|| StoreError::SectionTypeMismatch {
                    section: section.to_owned(),
                })?;
        Ok(f(state))
    }

    /// Clones the section's current state out of the store.
    pub fn state<S: Clone + 'static>(&self, section: &str) -> Result<S, StoreError> {
        self.with_state(section, S::clone)
    }

    /// Monotonic counter advanced by every externally visible change.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Registers a change listener. Dropping (or explicitly
    /// unsubscribing) the returned handle removes it; exactly once.
    pub fn subscribe(self: &Arc<Self>, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, Arc::new(listener)));
        Subscription {
            store: Arc::downgrade(self),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Delivers a pending notification synchronously, if any.
    pub fn flush(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.notify();
        }
    }

    /// Marks the store changed and notifies unless a batch is open.
    pub(crate) fn signal_change(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        if self.batch_depth.load(Ordering::Acquire) == 0 {
            self.flush();
        }
    }

    pub(crate) fn begin_batch(&self) {
        self.batch_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_batch(&self) {
        if self.batch_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.flush();
        }
    }

    fn notify(&self) {
        // Snapshot first: listeners may subscribe or unsubscribe while
        // being notified.
        let listeners: Vec<Listener> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener();
        }
    }

    fn remove_subscriber(&self, id: u64) {
        self.subscribers.write().retain(|(sid, _)| *sid != id);
    }
}

/// Handle returned by [`ThrottledStore::subscribe`].
pub struct Subscription {
    store: Weak<ThrottledStore>,
    id: u64,
    active: AtomicBool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(store) = self.store.upgrade() {
                store.remove_subscriber(self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
