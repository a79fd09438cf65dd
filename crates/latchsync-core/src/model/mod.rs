// ── Domain model ──
//
// Canonical types shared by every component of the sync core.

pub mod clock;
pub mod entity_id;
pub mod operation;
pub mod progress;
pub mod snapshot;

pub use clock::{LogicalClock, Timestamp};
pub use entity_id::{EntityId, OperationKey};
pub use operation::{Intent, Operation, OperationKind, OperationStatus};
pub use progress::{ErrorDescriptor, ErrorKind, ProgressRecord};
pub use snapshot::{FieldSource, Fields, Origin, PushEvent, Snapshot};
