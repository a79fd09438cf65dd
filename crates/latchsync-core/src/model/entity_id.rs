// ── Core identity types ──
//
// EntityId names a controllable object (lock, hub, property); OperationKey
// names a logical action against one. Both are opaque strings to the core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::operation::OperationKind;

// ── EntityId ────────────────────────────────────────────────────────

/// Identifier of a device, lock, or property as known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ── OperationKey ────────────────────────────────────────────────────

/// Stable identifier grouping retries and duplicate taps of one logical
/// action, conventionally `"<group>:<entity>"` (e.g. `"lock:hub-1"`).
///
/// At most one operation per key is ever in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Conventional key for `kind` against `entity`.
    ///
    /// Kinds that toggle the same physical state share a group, so a lock
    /// followed by an unlock coalesces instead of racing.
    pub fn for_entity(kind: OperationKind, entity: &EntityId) -> Self {
        Self(format!("{}:{entity}", kind.key_group()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Entity part of a conventional `"<group>:<entity>"` key.
    pub fn entity(&self) -> Option<EntityId> {
        self.0
            .split_once(':')
            .map(|(_, entity)| entity)
            .filter(|entity| !entity.is_empty())
            .map(EntityId::from)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OperationKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<String> for OperationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OperationKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
