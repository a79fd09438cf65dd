//! Offline-first synchronization core for access-device clients.
//!
//! This crate sits between a UI layer and the collaborators that actually
//! touch the world (a cloud request layer, a proximity link, a real-time
//! push channel). It provides:
//!
//! - **[`Session`]**: Owns the components below and the background tasks
//!   that connect them (reconnect drain, push ingestion).
//!
//! - **[`Dispatcher`]**: Connectivity-aware operation queue. Coalesces
//!   repeated submissions per [`OperationKey`], guarantees at most one
//!   in-flight effect per key, persists pending work write-ahead, and
//!   retries transient failures with exponential backoff.
//!
//! - **[`Reconciler`]**: Merges optimistic projections, effect
//!   confirmations, and push events into the [`EntityStore`] using a fixed
//!   origin/timestamp [`rank`]ing rule.
//!
//! - **[`ProgressTracker`]**: Per-key loading/message/error records for
//!   the UI.
//!
//! - **[`ConnectivityMonitor`]**: Online/offline status with an
//!   offline→online edge trigger.
//!
//! - **[`KvCache`]**: Durable storage contract, with [`MemoryCache`] and
//!   [`FileCache`] backends.
//!
//! Collaborators plug in through [`EffectExecutor`] and [`KvCache`]; push
//! events arrive through [`Session::attach_push`] or
//! [`Session::ingest_push`].

pub mod backoff;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod dispatch;
pub mod effect;
pub mod error;
pub mod model;
pub mod progress;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cache::{FileCache, KvCache, MemoryCache};
pub use config::{RetryPolicy, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use dispatch::{DispatchEvent, Dispatcher, SubmitOutcome};
pub use effect::{Confirmation, EffectExecutor, EffectRequest};
pub use error::{CacheError, EffectError, SyncError};
pub use progress::ProgressTracker;
pub use reconcile::{Ranking, Reconciler, rank};
pub use session::{Session, SessionState};
pub use store::{EntityStore, SubscriptionId};
pub use stream::{EntityStream, SnapshotStream};

// Model re-exports
pub use model::{
    EntityId, ErrorDescriptor, ErrorKind, FieldSource, Fields, Intent, LogicalClock, Operation,
    OperationKey, OperationKind, OperationStatus, Origin, ProgressRecord, PushEvent, Snapshot,
    Timestamp,
};
