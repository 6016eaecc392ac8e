//! Connection Gateway: origin admission, the single-slot session registry and
//! the `/call` and `/logs` websocket endpoints.

use super::{
    logs::LogEvent,
    protocol::{OutboundFrame, TelephonyFrame},
    session::{CallSession, TelephonyLeg},
};
use crate::state::AppState;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header::ORIGIN},
    response::{IntoResponse, Response},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Frames buffered between a socket task and the session loop.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Which origins may open a websocket.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    literals: Vec<String>,
    patterns: Vec<Regex>,
}

impl OriginPolicy {
    /// Builds a policy; every pattern must match the whole origin.
    pub fn new(literals: Vec<String>, patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:{p})$")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { literals, patterns })
    }

    /// An absent origin is admitted; telephony providers do not send one.
    pub fn admits(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.literals.iter().any(|l| l == origin) || self.patterns.iter().any(|p| p.is_match(origin))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Call,
    Logs,
}

impl Channel {
    fn index(self) -> usize {
        match self {
            Channel::Call => 0,
            Channel::Logs => 1,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Channel::Call => "/call",
            Channel::Logs => "/logs",
        }
    }
}

/// Proof of occupying a registry slot.
#[derive(Debug, Clone)]
pub struct SlotLease {
    pub channel: Channel,
    pub conn_id: Uuid,
    /// Cancelled when a newer connection takes the slot.
    pub token: CancellationToken,
    /// The connection this lease displaced, if any.
    pub superseded: Option<Uuid>,
}

struct Occupant {
    conn_id: Uuid,
    token: CancellationToken,
}

/// One slot per [`Channel`]; a new connection always replaces the old one.
#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<[Option<Occupant>; 2]>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the channel's slot, cancelling whoever held it.
    pub fn attach(&self, channel: Channel) -> SlotLease {
        self.attach_with(channel, |_| {})
    }

    /// Like [`attach`](Self::attach), but runs `install` with the new
    /// connection id before the slot lock is released, so a concurrent
    /// attach cannot interleave with whatever `install` registers.
    pub fn attach_with(&self, channel: Channel, install: impl FnOnce(Uuid)) -> SlotLease {
        let conn_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let previous = {
            let mut slots = self.slots.lock();
            install(conn_id);
            slots[channel.index()].replace(Occupant {
                conn_id,
                token: token.clone(),
            })
        };
        let superseded = previous.map(|old| {
            old.token.cancel();
            old.conn_id
        });
        SlotLease {
            channel,
            conn_id,
            token,
            superseded,
        }
    }

    /// Empties the slot if `lease` still owns it.
    pub fn release(&self, lease: &SlotLease) -> bool {
        let mut slots = self.slots.lock();
        let slot = &mut slots[lease.channel.index()];
        match slot {
            Some(occupant) if occupant.conn_id == lease.conn_id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn current(&self, channel: Channel) -> Option<Uuid> {
        self.slots.lock()[channel.index()]
            .as_ref()
            .map(|o| o.conn_id)
    }
}

#[derive(Debug, Deserialize)]
pub struct CallQuery {
    #[serde(rename = "callId")]
    pub call_id: Option<String>,
}

/// Extracts the origin, or `Err` when the header is present but unreadable.
fn origin(headers: &HeaderMap) -> Result<Option<&str>, ()> {
    match headers.get(ORIGIN) {
        None => Ok(None),
        Some(value) => value.to_str().map(Some).map_err(|_| ()),
    }
}

fn admit(state: &AppState, headers: &HeaderMap, channel: Channel) -> Result<(), Response> {
    let admitted = match origin(headers) {
        Ok(origin) => state.origins.admits(origin),
        Err(()) => false,
    };
    if admitted {
        return Ok(());
    }
    let origin = headers
        .get(ORIGIN)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
    warn!(?origin, path = channel.path(), "Rejected websocket origin");
    state.logs.publish(
        LogEvent::warn("connection.rejected", "Origin not allowed")
            .with_data(json!({"path": channel.path(), "origin": origin})),
    );
    Err((StatusCode::FORBIDDEN, "origin not allowed").into_response())
}

/// `GET /call[?callId=..]`: the telephony media stream.
pub async fn call_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<CallQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(rejection) = admit(&state, &headers, Channel::Call) {
        return rejection;
    }
    let call_id = query.call_id.filter(|id| !id.trim().is_empty());
    ws.on_upgrade(move |socket| handle_call_socket(socket, state, call_id))
}

/// `GET /logs`: the single log observer.
pub async fn logs_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(rejection) = admit(&state, &headers, Channel::Logs) {
        return rejection;
    }
    ws.on_upgrade(move |socket| handle_logs_socket(socket, state))
}

fn announce(state: &AppState, lease: &SlotLease, call_id: Option<&str>) {
    if let Some(old) = lease.superseded {
        info!(superseded = %old, "Replacing previous connection");
        state.logs.publish(
            LogEvent::info("connection.superseded", "Previous connection closed")
                .with_data(json!({"path": lease.channel.path(), "connId": old.to_string()})),
        );
    }
    state.logs.publish(
        LogEvent::info("connection.accepted", format!("Connected on {}", lease.channel.path()))
            .with_call(call_id)
            .with_data(json!({
                "path": lease.channel.path(),
                "callId": call_id,
                "connId": lease.conn_id.to_string(),
            })),
    );
}

async fn handle_call_socket(socket: WebSocket, state: Arc<AppState>, call_id: Option<String>) {
    let lease = state.registry.attach(Channel::Call);
    let span = info_span!(
        "call_session",
        call_id = call_id.as_deref().unwrap_or("-"),
        conn_id = %lease.conn_id
    );
    async move {
        info!("Telephony leg accepted");
        announce(&state, &lease, call_id.as_deref());

        let (sink, stream) = socket.split();
        let (frames_tx, frames_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let reader = tokio::spawn(read_telephony(stream, frames_tx).in_current_span());
        let writer = tokio::spawn(write_telephony(sink, outbound_rx).in_current_span());

        let telephony = TelephonyLeg {
            frames: frames_rx,
            outbound: outbound_tx,
        };
        match CallSession::new(
            state.session_context(),
            call_id,
            lease.conn_id,
            lease.token.clone(),
            telephony,
        ) {
            Ok(session) => {
                session.run().await;
            }
            Err(e) => warn!(error = %e, "Could not start call session"),
        }

        // The session dropped its outbound sender, so the writer closes the socket.
        reader.abort();
        if writer.await.is_err() {
            debug!("Telephony writer was cancelled");
        }
        state.registry.release(&lease);
    }
    .instrument(span)
    .await;
}

async fn read_telephony(mut stream: SplitStream<WebSocket>, frames: mpsc::Sender<TelephonyFrame>) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                info!(?frame, "Telephony leg sent close");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Telephony socket read failed");
                break;
            }
        };
        match TelephonyFrame::parse(text.as_str()) {
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed telephony frame"),
        }
    }
}

async fn write_telephony(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = outbound.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize telephony frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            warn!(error = %e, "Telephony socket write failed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn handle_logs_socket(socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::channel::<LogEvent>(CHANNEL_BUFFER_SIZE);
    let lease = state
        .registry
        .attach_with(Channel::Logs, |conn_id| state.logs.attach(conn_id, tx));
    let span = info_span!("log_observer", conn_id = %lease.conn_id);
    async move {
        announce(&state, &lease, None);
        info!("Log observer attached");

        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                biased;
                _ = lease.token.cancelled() => {
                    info!("Log observer superseded");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize log event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        state.logs.detach(lease.conn_id);
        state.registry.release(&lease);
        let _ = sink.send(Message::Close(None)).await;
        info!("Log observer detached");
    }
    .instrument(span)
    .await;
}
