// ── Effect executor contract ──
//
// The side-effect collaborator (cloud request layer or proximity link).
// Invocations are bounded by the dispatcher's timeout and must be safe to
// repeat for the same operation key: delivery is at-least-once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EffectError;
use crate::model::{EntityId, Fields, OperationKey, OperationKind, Timestamp};

/// One effect invocation as handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectRequest {
    /// Stable for every attempt of the same queued operation.
    pub operation_id: Uuid,
    pub key: OperationKey,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    /// Zero-based attempt number.
    pub attempt: u32,
}

/// Acknowledged outcome of an effect, fed to the reconciler as a
/// `Confirmed` observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub entity_id: EntityId,
    #[serde(default)]
    pub fields: Fields,
    /// Authority-side time of the acknowledged state.
    pub timestamp: Timestamp,
    /// Short human summary, shown as the progress message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[async_trait]
pub trait EffectExecutor: Send + Sync + 'static {
    async fn execute(&self, request: &EffectRequest) -> Result<Confirmation, EffectError>;
}
