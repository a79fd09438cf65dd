// ── Operations ──
//
// A unit of user intent that needs a remote or proximity-link side effect.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::clock::Timestamp;
use super::entity_id::{EntityId, OperationKey};
use super::snapshot::Fields;

/// Effect type requested from the executor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum OperationKind {
    Lock,
    Unlock,
    Unlatch,
    UpdateSettings,
}

impl OperationKind {
    /// Group prefix used to build conventional operation keys.
    pub fn key_group(self) -> &'static str {
        match self {
            Self::Lock | Self::Unlock | Self::Unlatch => "lock",
            Self::UpdateSettings => "settings",
        }
    }
}

/// Lifecycle position of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// A queued operation as the dispatcher owns and persists it.
///
/// `payload` and `kind` are replaced when a later submission with the same
/// key is coalesced into this entry; `revision` counts those replacements
/// so the dispatcher can tell whether an in-flight effect ran the newest
/// intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub key: OperationKey,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
    pub attempt: u32,
    #[serde(default)]
    pub revision: u64,
    pub status: OperationStatus,
}

impl Operation {
    pub(crate) fn new(
        key: OperationKey,
        kind: OperationKind,
        payload: serde_json::Value,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            kind,
            payload,
            created_at,
            attempt: 0,
            revision: 0,
            status: OperationStatus::Pending,
        }
    }

    /// Fold a newer submission for the same key into this entry.
    pub(crate) fn coalesce(&mut self, kind: OperationKind, payload: serde_json::Value) {
        self.kind = kind;
        self.payload = payload;
        self.revision += 1;
        if self.status != OperationStatus::InFlight {
            self.attempt = 0;
        }
    }
}

/// A submission from the UI layer.
#[derive(Debug, Clone)]
pub struct Intent {
    pub key: OperationKey,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    /// Optional optimistic projection applied immediately as a
    /// `LocalOptimistic` observation.
    pub optimistic: Option<(EntityId, Fields)>,
}

impl Intent {
    pub fn new(key: impl Into<OperationKey>, kind: OperationKind, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            kind,
            payload,
            optimistic: None,
        }
    }

    pub fn with_optimistic(mut self, entity: impl Into<EntityId>, fields: Fields) -> Self {
        self.optimistic = Some((entity.into(), fields));
        self
    }
}
