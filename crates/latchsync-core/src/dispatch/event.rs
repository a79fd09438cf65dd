// ── Dispatch outcomes and events ──

use std::time::Duration;

use crate::effect::Confirmation;
use crate::model::{ErrorDescriptor, OperationKey};

/// What `submit` resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The effect (for the newest coalesced intent) was acknowledged.
    Succeeded(Confirmation),
    /// Terminal failure: policy rejection or retries exhausted.
    Failed(ErrorDescriptor),
    /// Accepted while offline; runs on the next reconnect drain.
    Deferred,
}

impl SubmitOutcome {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred)
    }
}

/// Lifecycle notifications broadcast by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// Accepted and persisted while offline.
    Queued { key: OperationKey },
    Started { key: OperationKey, attempt: u32 },
    Succeeded { key: OperationKey },
    /// Transient failure; the next attempt runs after `delay`.
    Retrying {
        key: OperationKey,
        attempt: u32,
        delay: Duration,
    },
    /// Connectivity dropped before the effect could start.
    Deferred { key: OperationKey },
    Failed {
        key: OperationKey,
        error: ErrorDescriptor,
    },
}

impl DispatchEvent {
    pub fn key(&self) -> &OperationKey {
        match self {
            Self::Queued { key }
            | Self::Started { key, .. }
            | Self::Succeeded { key }
            | Self::Retrying { key, .. }
            | Self::Deferred { key }
            | Self::Failed { key, .. } => key,
        }
    }
}
