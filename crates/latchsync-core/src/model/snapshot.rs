// ── Entity snapshots ──

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::clock::Timestamp;
use super::entity_id::EntityId;

/// Field name to value mapping carried by observations and snapshots.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Provenance of an observation, used to rank it against the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Projected locally from the user's own intent before any acknowledgment.
    LocalOptimistic,
    /// Server or device acknowledgment of a dispatched effect.
    Confirmed,
    /// Out-of-band update from the real-time channel.
    Pushed,
}

/// Provenance of a single field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSource {
    pub origin: Origin,
    pub timestamp: Timestamp,
}

/// Last-known reconciled state of one entity.
///
/// Never mutated in place: the reconciler swaps in a new `Arc<Snapshot>`
/// whenever an observation wins at least one field.
///
/// `source_timestamp` and `origin` describe the highest-ranked observation
/// applied so far. Each field additionally remembers the observation that
/// last wrote it in `sources`; fields missing there (snapshots persisted
/// before per-field tracking) fall back to the snapshot-level provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: EntityId,
    pub fields: Fields,
    pub source_timestamp: Timestamp,
    pub origin: Origin,
    #[serde(default)]
    pub sources: BTreeMap<String, FieldSource>,
}

impl Snapshot {
    /// Snapshot whose every field was written by one observation.
    pub fn new(
        entity_id: EntityId,
        fields: Fields,
        source_timestamp: Timestamp,
        origin: Origin,
    ) -> Self {
        let source = FieldSource {
            origin,
            timestamp: source_timestamp,
        };
        let sources = fields.keys().map(|name| (name.clone(), source)).collect();
        Self {
            entity_id,
            fields,
            source_timestamp,
            origin,
            sources,
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Convenience accessor for string-valued fields such as `state`.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(serde_json::Value::as_str)
    }

    /// Origin and timestamp of the observation that last wrote `name`.
    pub fn source_of(&self, name: &str) -> (Origin, Timestamp) {
        self.sources.get(name).map_or(
            (self.origin, self.source_timestamp),
            |source| (source.origin, source.timestamp),
        )
    }
}

/// Event delivered by the real-time push source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub entity_id: EntityId,
    #[serde(default)]
    pub fields: Fields,
    pub timestamp: Timestamp,
}
