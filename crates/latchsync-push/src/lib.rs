//! Real-time push adapter for latchsync.
//!
//! Maintains a WebSocket connection to the backend's event endpoint,
//! decodes `entity.update` and `batch` frames into
//! [`PushEvent`](latchsync_core::PushEvent)s, and fans them out over a
//! broadcast channel that plugs straight into
//! [`Session::attach_push`](latchsync_core::Session::attach_push).

pub mod channel;
pub mod error;
pub mod frame;

pub use channel::{PushChannel, ReconnectConfig};
pub use error::PushError;
pub use frame::decode_frame;
