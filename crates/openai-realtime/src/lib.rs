//! Client for the OpenAI Realtime API.
//!
//! [`connect`] performs the authenticated websocket handshake and splits the
//! socket into two tasks: a reader that decodes [`ServerEvent`]s and a writer
//! that encodes [`ClientEvent`]s. Callers only ever see the two typed channels
//! in [`RealtimeConnection`], so the rest of the application never touches
//! websocket frames directly. The event vocabulary is `async-openai`'s
//! realtime types, re-exported as [`types`].

pub mod events;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self, client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage,
    },
};
use tracing::{debug, info, warn};

pub use async_openai::types::realtime as types;
use serde::Deserialize;
use types::{ClientEvent, ServerEvent};

pub const DEFAULT_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("invalid realtime request: {0}")]
    Request(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

/// Where and how to reach the realtime API.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub api_key: SecretString,
}

impl RealtimeConfig {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            model: model.into(),
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }
}

/// An open model leg.
///
/// Dropping `events_tx` makes the writer send a close frame; the `events_rx`
/// stream ends when the server closes or the socket errors.
pub struct RealtimeConnection {
    pub events_tx: mpsc::Sender<ClientEvent>,
    pub events_rx: mpsc::Receiver<ServerEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RealtimeConnection {
    /// Builds a connection from already-running pump tasks.
    pub fn from_parts(
        events_tx: mpsc::Sender<ClientEvent>,
        events_rx: mpsc::Receiver<ServerEvent>,
        reader: JoinHandle<()>,
        writer: JoinHandle<()>,
    ) -> Self {
        Self {
            events_tx,
            events_rx,
            reader,
            writer,
        }
    }

    /// Splits off the channels, leaving the pump tasks owned by the guard.
    pub fn into_channels(
        self,
    ) -> (
        mpsc::Sender<ClientEvent>,
        mpsc::Receiver<ServerEvent>,
        ConnectionGuard,
    ) {
        let Self {
            events_tx,
            events_rx,
            reader,
            writer,
        } = self;
        (events_tx, events_rx, ConnectionGuard { reader, writer })
    }
}

/// Owns the socket pump tasks.
///
/// Dropping the guard aborts the reader. The writer is left to drain: it sends
/// a close frame and exits on its own once every `events_tx` clone is gone.
pub struct ConnectionGuard {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionGuard {
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Opens a websocket to the realtime API and starts the reader/writer pumps.
pub async fn connect(config: &RealtimeConfig) -> Result<RealtimeConnection, RealtimeError> {
    let mut request = config.endpoint().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key.expose_secret()))
        .map_err(|e| RealtimeError::Request(e.to_string()))?;
    request.headers_mut().insert("Authorization", bearer);
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (ws_stream, _) = connect_async(request).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    info!(model = %config.model, "Connected to OpenAI Realtime API.");

    let (client_tx, mut client_rx) = mpsc::channel::<ClientEvent>(CHANNEL_CAPACITY);
    let (server_tx, server_rx) = mpsc::channel::<ServerEvent>(CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(event) = client_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize realtime client event");
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                warn!(error = %e, "Realtime socket write failed");
                return;
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
        debug!("Realtime writer finished.");
    });

    let reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            let text = match msg {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(frame)) => {
                    info!(?frame, "Realtime API closed the connection.");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Realtime socket read failed");
                    break;
                }
            };
            match decode_server_event(text.as_str()) {
                Some(event) => {
                    if server_tx.send(event).await.is_err() {
                        break;
                    }
                }
                None => continue,
            }
        }
        debug!("Realtime reader finished.");
    });

    Ok(RealtimeConnection::from_parts(
        client_tx, server_rx, reader, writer,
    ))
}

/// Decodes one text frame, logging and discarding anything unusable.
///
/// Frames of a type the relay does not act on are dropped quietly. A parse
/// failure on one it does act on is logged as a warning.
pub fn decode_server_event(raw: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerEvent>(raw) {
        Ok(event) => Some(event),
        Err(e) => match event_type(raw) {
            Some(kind) if !is_handled_event(&kind) => {
                debug!(event_type = %kind, "Ignoring realtime event");
                None
            }
            kind => {
                warn!(error = %e, event_type = ?kind, "Malformed realtime event dropped");
                None
            }
        },
    }
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "type")]
    kind: String,
}

/// Reads just the `type` field of a raw event.
fn event_type(raw: &str) -> Option<String> {
    serde_json::from_str::<Tagged>(raw).ok().map(|t| t.kind)
}

/// Server event types the relay acts on.
const HANDLED_EVENTS: &[&str] = &[
    "error",
    "session.created",
    "session.updated",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "conversation.item.input_audio_transcription.completed",
    "response.created",
    "response.done",
    "response.output_item.added",
    "response.audio.delta",
    "response.audio.done",
    "response.audio_transcript.done",
    "response.function_call_arguments.done",
];

fn is_handled_event(kind: &str) -> bool {
    HANDLED_EVENTS.contains(&kind)
}
