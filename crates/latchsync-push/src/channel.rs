//! Push channel with auto-reconnect.
//!
//! Connects to the backend's real-time endpoint and broadcasts decoded
//! [`PushEvent`]s through a [`tokio::sync::broadcast`] channel. Dropped
//! connections are re-established with exponential backoff + jitter.
//!
//! # Example
//!
//! ```rust,ignore
//! use latchsync_push::{PushChannel, ReconnectConfig};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let url = Url::parse("wss://push.example.com/v1/events")?;
//! let channel = PushChannel::connect(url, ReconnectConfig::default(), CancellationToken::new(), None)?;
//!
//! session.attach_push(channel.subscribe());
//! ```

use std::time::Duration;

use futures_util::StreamExt;
use latchsync_core::PushEvent;
use latchsync_core::backoff::exponential_delay;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::PushError;
use crate::frame::decode_frame;

// ── Broadcast channel capacity ───────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for push reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Consecutive failed attempts tolerated before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(self.initial_delay, self.max_delay, attempt)
    }
}

// ── PushChannel ──────────────────────────────────────────────────────

/// Handle to a running push stream.
///
/// Subscribers see [`broadcast::error::RecvError::Closed`] once the
/// background loop exits, either through [`shutdown`](Self::shutdown) or
/// because the retry limit was reached.
pub struct PushChannel {
    event_rx: broadcast::Receiver<PushEvent>,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl PushChannel {
    /// Validate the endpoint and spawn the reconnection loop.
    ///
    /// Returns as soon as the task is spawned; the first connection attempt
    /// happens in the background. Must be called from within a Tokio
    /// runtime.
    pub fn connect(
        url: Url,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
        bearer: Option<SecretString>,
    ) -> Result<Self, PushError> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PushError::InvalidUrl {
                url: url.to_string(),
            });
        }

        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connected_tx, connected) = watch::channel(false);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            push_loop(url, event_tx, connected_tx, reconnect, task_cancel, bearer).await;
        });

        Ok(Self {
            event_rx,
            connected,
            cancel,
        })
    }

    /// New receiver for decoded push events.
    ///
    /// Only events broadcast after this call are delivered. A consumer that
    /// falls behind receives [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.event_rx.resubscribe()
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the connection state, e.g. to feed a connectivity monitor.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Signal the background task to close the socket and exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Main loop: connect → read → on error, backoff → reconnect.
///
/// A session that delivered at least one frame resets the backoff. One that
/// ended before any frame arrived, cleanly or not, counts as a failed
/// attempt, so a server that accepts and immediately hangs up is retried on
/// the backoff schedule rather than in a tight loop.
async fn push_loop(
    url: Url,
    event_tx: broadcast::Sender<PushEvent>,
    connected: watch::Sender<bool>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    bearer: Option<SecretString>,
) {
    let mut attempt: u32 = 0;

    while !cancel.is_cancelled() {
        let mut frames: u64 = 0;
        let result = connect_and_read(
            &url,
            &event_tx,
            &connected,
            &cancel,
            bearer.as_ref(),
            &mut frames,
        )
        .await;
        connected.send_replace(false);

        if cancel.is_cancelled() {
            break;
        }
        if frames > 0 {
            attempt = 0;
        }

        match result {
            Ok(()) if frames > 0 => {
                tracing::info!(frames, "push channel disconnected cleanly, reconnecting");
                continue;
            }
            Ok(()) => tracing::warn!(attempt, "push channel closed before any frame"),
            Err(e) => tracing::warn!(error = %e, attempt, "push channel error"),
        }

        if let Some(max) = reconnect.max_retries {
            if attempt >= max {
                tracing::error!(max_retries = max, "push reconnection limit reached, giving up");
                break;
            }
        }

        let delay = reconnect.delay_for(attempt);
        tracing::info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "waiting before push reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        attempt = attempt.saturating_add(1);
    }

    tracing::debug!("push loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one connection and read frames until it drops.
///
/// A bearer token, when present, is sent as an `Authorization` header on
/// the upgrade request. Every text frame received bumps `frames`.
async fn connect_and_read(
    url: &Url,
    event_tx: &broadcast::Sender<PushEvent>,
    connected: &watch::Sender<bool>,
    cancel: &CancellationToken,
    bearer: Option<&SecretString>,
    frames: &mut u64,
) -> Result<(), PushError> {
    tracing::info!(url = %url, "connecting to push channel");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| PushError::Connect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    if let Some(token) = bearer {
        request = request.with_header("Authorization", format!("Bearer {}", token.expose_secret()));
    }

    let connecting = tokio_tungstenite::connect_async(request);
    let (mut ws_stream, _response) = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        result = connecting => result.map_err(|e| PushError::Connect(e.to_string()))?,
    };

    tracing::info!("push channel connected");
    connected.send_replace(true);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if let Err(e) = ws_stream.close(None).await {
                    tracing::debug!(error = %e, "push close handshake failed");
                }
                return Ok(());
            }
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        *frames += 1;
                        decode_and_broadcast(&text, event_tx);
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "push close frame received"
                            );
                        } else {
                            tracing::info!("push close frame received (no payload)");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(PushError::Stream(e.to_string()));
                    }
                    None => {
                        tracing::info!("push stream ended");
                        return Ok(());
                    }
                    // Ping is answered by tungstenite; Binary, Pong and raw frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Decode a text frame and broadcast every event inside it.
fn decode_and_broadcast(text: &str, event_tx: &broadcast::Sender<PushEvent>) {
    let events = match decode_frame(text) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed push frame");
            return;
        }
    };

    for event in events {
        tracing::trace!(entity = %event.entity_id, timestamp = %event.timestamp, "push event");
        // No active subscribers is not an error.
        let _ = event_tx.send(event);
    }
}

// ── Tests ────────────────────────────────────────────────────────────
