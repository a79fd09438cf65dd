// ── Push frame decoding ──
//
// Every text frame is a JSON object tagged by `type`:
//
//   {"type":"entity.update","entity_id":"hub-1","timestamp":15,"fields":{..}}
//   {"type":"batch","events":[{"entity_id":..,"timestamp":..,"fields":{..}}, ..]}
//   {"type":"ping"}
//
// Unknown types decode to nothing so servers can add message kinds without
// breaking older clients.

use latchsync_core::PushEvent;
use serde::Deserialize;

use crate::error::PushError;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Frame {
    #[serde(rename = "entity.update")]
    EntityUpdate(PushEvent),

    #[serde(rename = "batch")]
    Batch { events: Vec<PushEvent> },

    #[serde(rename = "ping")]
    Ping,

    #[serde(other)]
    Unknown,
}

/// Decode one text frame into the push events it carries.
///
/// Keep-alive and unrecognised frames yield an empty vector. A frame that
/// is not valid JSON, or an update missing `entity_id`/`timestamp`, is an
/// error.
pub fn decode_frame(text: &str) -> Result<Vec<PushEvent>, PushError> {
    let frame: Frame = serde_json::from_str(text)?;
    Ok(match frame {
        Frame::EntityUpdate(event) => vec![event],
        Frame::Batch { events } => events,
        Frame::Ping => {
            tracing::trace!("push keep-alive");
            Vec::new()
        }
        Frame::Unknown => {
            tracing::debug!("ignoring push frame of unknown type");
            Vec::new()
        }
    })
}
