//! Rendering of contributed UI fragments.
//!
//! The concrete rendering technology is a collaborator: contributions
//! are zero-argument factories producing an opaque [`Fragment`] the
//! core never inspects. Rendering evaluates each item's activation
//! predicate and factory at the smallest possible boundary, so one
//! failing contribution logs and renders as empty instead of taking its
//! siblings down.

use std::any::Any;
use std::sync::Arc;

use crate::api::SlotKey;
use crate::logging::{HostLogger, Severity};
use crate::slot::ExtensionSlot;

/// An opaque renderable fragment. Constructed by the embedding UI
/// layer, carried by the core as inert data.
pub struct Fragment(Box<dyn Any + Send + Sync>);

impl Fragment {
    pub fn new<V: Any + Send + Sync>(value: V) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.0.downcast_ref::<V>()
    }

    pub fn downcast<V: Any>(self) -> Result<Box<V>, Fragment> {
        self.0.downcast::<V>().map_err(Fragment)
    }
}

/// A fallible zero-argument factory contributed to a renderable slot.
pub type Contributor<V> = Arc<dyn Fn() -> anyhow::Result<V> + Send + Sync>;

/// Factory producing the opaque fragment type.
pub type ViewFactory = Contributor<Fragment>;

/// The host's main view slot; shells contribute through
/// `Shell::contribute_main_view`.
pub const MAIN_VIEW: SlotKey<ViewFactory> = SlotKey::new("plugkit.main_view");

/// Renders every active item of `slot`: inactive predicates skip the
/// item, failing factories log with the contributing module's identity
/// and are suppressed.
pub fn render_contributions<V>(
    slot: &ExtensionSlot<Contributor<V>>,
    logger: &dyn HostLogger,
) -> Vec<V>
where
    V: 'static,
{
    let mut rendered = Vec::new();
    for item in slot.get_items(false) {
        if !item.condition_holds() {
            continue;
        }
        match (item.contribution().as_ref())() {
            Ok(value) => rendered.push(value),
            Err(error) => {
                logger.log(
                    Severity::Error,
                    "slot.render_failed",
                    Some(&error),
                    &[
                        ("slot", serde_json::Value::from(slot.name())),
                        ("module", serde_json::Value::from(item.module())),
                    ],
                );
            }
        }
    }
    rendered
}
