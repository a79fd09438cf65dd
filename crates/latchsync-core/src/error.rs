// ── Core error types ──
//
// Failures the sync core surfaces to its host. Effect failures are split
// into transient (retried) and policy (terminal) classes; the dispatcher
// turns whichever one ends an operation into an `ErrorDescriptor` on the
// progress tracker instead of propagating it.

use thiserror::Error;

use crate::model::{ErrorDescriptor, ErrorKind};

// ── Effect collaborator errors ───────────────────────────────────────

/// Result error of a single effect invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error("effect timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("rejected by remote authority: {message}")]
    Rejected {
        /// Remote code, e.g. `"permission_denied"`.
        code: Option<String>,
        message: String,
    },
}

impl EffectError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Transient failures are retried with backoff; rejections are terminal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => {
                ErrorDescriptor::new(ErrorKind::Transient, self.to_string())
            }
            Self::Rejected { code, message } => ErrorDescriptor {
                kind: ErrorKind::PolicyRejection,
                code: code.clone(),
                message: message.clone(),
            },
        }
    }
}

// ── Durable cache errors ─────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid cache key: {key:?}")]
    InvalidKey { key: String },

    #[error("cache backend error: {message}")]
    Backend { message: String },
}

// ── Sync core errors ─────────────────────────────────────────────────

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum SyncError {
    // ── Effect outcomes ──────────────────────────────────────────────
    #[error("transient effect failure for {key}: {source}")]
    TransientEffect {
        key: String,
        #[source]
        source: EffectError,
    },

    #[error("operation {key} rejected: {message}")]
    PolicyRejection {
        key: String,
        code: Option<String>,
        message: String,
    },

    #[error("operation {key} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    // ── Persistence ──────────────────────────────────────────────────
    #[error("could not persist queued operation {key}: {source}")]
    QueuePersistence {
        key: String,
        #[source]
        source: CacheError,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("sync session is closed")]
    SessionClosed,

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl SyncError {
    /// Classify an effect failure for `key` into the core taxonomy.
    pub(crate) fn from_effect(key: &str, err: EffectError) -> Self {
        match err {
            EffectError::Rejected { code, message } => Self::PolicyRejection {
                key: key.to_owned(),
                code,
                message,
            },
            source => Self::TransientEffect {
                key: key.to_owned(),
                source,
            },
        }
    }

    /// Descriptor suitable for the progress tracker.
    pub fn descriptor(&self) -> ErrorDescriptor {
        match self {
            Self::TransientEffect { source, .. } => source.descriptor(),
            Self::PolicyRejection { code, message, .. } => ErrorDescriptor {
                kind: ErrorKind::PolicyRejection,
                code: code.clone(),
                message: message.clone(),
            },
            Self::RetriesExhausted { .. } => {
                ErrorDescriptor::new(ErrorKind::RetriesExhausted, self.to_string())
            }
            Self::QueuePersistence { .. } | Self::Cache(_) | Self::Serialization(_) => {
                ErrorDescriptor::new(ErrorKind::Persistence, self.to_string())
            }
            Self::SessionClosed | Self::Config { .. } => {
                ErrorDescriptor::new(ErrorKind::Transient, self.to_string())
            }
        }
    }
}
