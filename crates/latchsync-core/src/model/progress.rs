// ── Progress records ──

use serde::{Deserialize, Serialize};

/// Machine-readable class of a surfaced failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    PolicyRejection,
    RetriesExhausted,
    Persistence,
}

/// User-displayable failure attached to a progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    /// Code reported by the remote authority, if any (e.g. `"permission_denied"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Status of one logical operation as observed by the UI.
///
/// The default (`loading = false`, no message, no error) is what observers
/// read for keys that never dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub loading: bool,
    pub message: Option<String>,
    pub error: Option<ErrorDescriptor>,
}
