// ── Durable key-value cache ──
//
// The only state that survives a process restart: the queue of pending
// operations and the last reconciled snapshot of each entity.
//
// Key layout:
//
// ```text
// queue/<operationKey>     JSON-encoded `Operation`
// snapshot/<entityId>      JSON-encoded `Snapshot`
// ```

mod file;
mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheError;
use crate::model::{EntityId, OperationKey};

pub use file::FileCache;
pub use memory::MemoryCache;

/// Prefix under which queued operations are stored.
pub const QUEUE_PREFIX: &str = "queue/";

/// Prefix under which reconciled snapshots are stored.
pub const SNAPSHOT_PREFIX: &str = "snapshot/";

/// Durable storage contract required by the sync core.
///
/// Implementations must be safe to share across tasks. Individual calls
/// need not be transactional, but a completed `set` must survive a crash.
#[async_trait]
pub trait KvCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String) -> Result<(), CacheError>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

pub(crate) fn queue_key(key: &OperationKey) -> String {
    format!("{QUEUE_PREFIX}{key}")
}

pub(crate) fn snapshot_key(id: &EntityId) -> String {
    format!("{SNAPSHOT_PREFIX}{id}")
}

/// Load and decode a JSON value.
pub async fn load_json<T: DeserializeOwned>(
    cache: &dyn KvCache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and store a JSON value.
pub async fn store_json<T: Serialize + Sync>(
    cache: &dyn KvCache,
    key: &str,
    value: &T,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, raw).await
}
