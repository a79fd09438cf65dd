// ── Canonical entity store ──
//
// The reconciled, UI-visible view of entity state. Single writer (the
// reconciler), many readers.

mod collection;
mod entity_store;

pub use entity_store::{EntityStore, SubscriptionId};
