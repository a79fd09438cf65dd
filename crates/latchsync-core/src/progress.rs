// ── Progress tracker ──
//
// Per-key loading/message/error records observed by the UI. A pure
// in-memory projection: only the dispatcher writes, observers read or
// watch. Writes for one key arrive in the dispatcher's call order because
// at most one operation per key is ever in flight.

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::model::{ErrorDescriptor, OperationKey, ProgressRecord};

const QUEUED_MESSAGE: &str = "queued";
const RETRYING_MESSAGE: &str = "retrying";

#[derive(Debug, Default)]
pub struct ProgressTracker {
    records: DashMap<OperationKey, watch::Sender<ProgressRecord>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effect started for `key`.
    pub fn begin(&self, key: &OperationKey) {
        self.write(
            key,
            ProgressRecord {
                loading: true,
                message: None,
                error: None,
            },
        );
    }

    /// Effect finished successfully; `summary` is shown as the message.
    pub fn succeed(&self, key: &OperationKey, summary: Option<String>) {
        self.write(
            key,
            ProgressRecord {
                loading: false,
                message: summary,
                error: None,
            },
        );
    }

    /// Terminal failure surfaced to the user.
    pub fn fail(&self, key: &OperationKey, error: ErrorDescriptor) {
        self.write(
            key,
            ProgressRecord {
                loading: false,
                message: None,
                error: Some(error),
            },
        );
    }

    /// Accepted while offline; not a failure.
    pub fn queued(&self, key: &OperationKey) {
        self.write(
            key,
            ProgressRecord {
                loading: false,
                message: Some(QUEUED_MESSAGE.to_owned()),
                error: None,
            },
        );
    }

    /// Transient failure with retries left. Stays loading, no error shown.
    pub fn retrying(&self, key: &OperationKey, attempt: u32) {
        debug!(key = %key, attempt, "progress: retrying");
        self.write(
            key,
            ProgressRecord {
                loading: true,
                message: Some(RETRYING_MESSAGE.to_owned()),
                error: None,
            },
        );
    }

    /// Current record, or the default for keys never written.
    pub fn read(&self, key: &OperationKey) -> ProgressRecord {
        self.records
            .get(key)
            .map(|sender| sender.borrow().clone())
            .unwrap_or_default()
    }

    /// Watch a key's record. Unknown keys start at the default record.
    pub fn watch(&self, key: &OperationKey) -> watch::Receiver<ProgressRecord> {
        self.records
            .entry(key.clone())
            .or_insert_with(|| watch::channel(ProgressRecord::default()).0)
            .subscribe()
    }

    /// Reset every record to the default and forget all keys.
    pub fn clear(&self) {
        for entry in &self.records {
            entry.value().send_replace(ProgressRecord::default());
        }
        self.records.clear();
    }

    fn write(&self, key: &OperationKey, record: ProgressRecord) {
        self.records
            .entry(key.clone())
            .or_insert_with(|| watch::channel(ProgressRecord::default()).0)
            .send_replace(record);
    }
}
