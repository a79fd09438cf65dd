use thiserror::Error;

/// Errors raised by the push channel.
///
/// Connection failures never reach subscribers: the reconnect loop logs
/// them and backs off. Only [`PushChannel::connect`](crate::PushChannel::connect)
/// and [`decode_frame`](crate::decode_frame) return these directly.
#[derive(Debug, Error)]
pub enum PushError {
    /// The endpoint is not a `ws://` or `wss://` URL.
    #[error("Invalid push URL: {url}")]
    InvalidUrl { url: String },

    /// Upgrade request could not be built or the handshake failed.
    #[error("Push connection failed: {0}")]
    Connect(String),

    /// The stream broke after the connection was established.
    #[error("Push stream error: {0}")]
    Stream(String),

    /// A text frame was not a valid push message.
    #[error("Malformed push frame: {0}")]
    Decode(#[from] serde_json::Error),
}
