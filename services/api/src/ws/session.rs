//! The call relay session.
//!
//! A [`CallSession`] owns one telephony leg (already split into a frame
//! receiver and an outbound sender by the gateway) and opens the model leg
//! itself. Everything that happens on the call is driven from a single loop
//! in [`CallSession::run`], so per-direction ordering falls out of the loop
//! structure. Tool handlers are the one exception: they run as spawned tasks
//! and report back through a channel, which keeps audio flowing while a tool
//! is outstanding.

use super::{
    logs::{LogChannel, LogEvent},
    protocol::{OutboundFrame, SequenceTracker, TelephonyFrame},
    provider::{ModelConnector, session_config},
    state_machine::{SessionState, SessionStateMachine},
};
use crate::audio_utils::{AudioError, Direction, Transcoder, payload_duration_ms};
use callrelay_core::{
    AgentScript, PendingConfigStore,
    tools::{ToolContext, ToolError, ToolOutcome, ToolRegistry},
};
use chrono::{DateTime, Utc};
use openai_realtime::{
    ConnectionGuard, events,
    types::{AudioFormat, ClientEvent, ItemType, ServerEvent},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, trace, warn};
use utoipa::ToSchema;
use uuid::Uuid;

const GREETING_PROMPT: &str =
    "The caller has just picked up. Greet them with your opening line now.";

/// What `/sessions/current` reports about the live call.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub call_id: Option<String>,
    pub state: SessionState,
    pub conn_id: String,
    pub started_at: DateTime<Utc>,
}

/// Shared collaborators a session needs, cloned out of the application state.
#[derive(Clone)]
pub struct SessionContext {
    pub tools: Arc<ToolRegistry>,
    pub pending: Arc<PendingConfigStore>,
    pub logs: LogChannel,
    pub connector: Arc<dyn ModelConnector>,
    pub status: Arc<watch::Sender<Option<SessionStatus>>>,
    pub voice: String,
    pub audio_format: AudioFormat,
    pub setup_timeout: Duration,
}

/// The telephony side of a call, as seen by the session.
pub struct TelephonyLeg {
    pub frames: mpsc::Receiver<TelephonyFrame>,
    pub outbound: mpsc::Sender<OutboundFrame>,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    TelephonyClosed,
    StreamStopped,
    ModelClosed,
    Superseded,
    SetupTimeout,
    SetupFailed(String),
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TelephonyClosed => "telephony_closed",
            Self::StreamStopped => "stream_stopped",
            Self::ModelClosed => "model_closed",
            Self::Superseded => "superseded",
            Self::SetupTimeout => "setup_timeout",
            Self::SetupFailed(_) => "setup_failed",
        }
    }

    /// Whether the close was caused by a failing leg rather than a normal hangup.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ModelClosed | Self::SetupTimeout | Self::SetupFailed(_)
        )
    }
}

struct ToolInvocation {
    call_id: String,
    name: String,
    arguments: String,
}

struct ToolCompletion {
    call_id: String,
    name: String,
    outcome: ToolOutcome,
}

/// Assistant audio currently queued on the telephony side.
struct Playback {
    item_id: String,
    /// Inbound media timestamp when the first chunk of the item went out.
    started_at_ms: u64,
    sent_ms: u64,
}

enum SetupStep<T> {
    Done(T),
    Frame(Option<TelephonyFrame>),
    Cancelled,
    TimedOut,
}

enum Step {
    Cancelled,
    Telephony(Option<TelephonyFrame>),
    Model(Option<ServerEvent>),
    Tool(ToolCompletion),
}

pub struct CallSession {
    ctx: SessionContext,
    call_id: Option<String>,
    conn_id: Uuid,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    machine: SessionStateMachine,
    telephony: TelephonyLeg,

    model_tx: Option<mpsc::Sender<ClientEvent>>,
    model_guard: Option<ConnectionGuard>,

    stream_sid: Option<String>,
    inbound_seq: SequenceTracker,
    outbound_seq: u64,
    last_media_ms: u64,
    frames_forwarded: u64,
    inbound_audio: Transcoder,
    outbound_audio: Transcoder,

    marks: VecDeque<String>,
    playback: Option<Playback>,
    interrupted_item: Option<String>,
    response_active: bool,
    resume_pending: bool,

    function_names: HashMap<String, String>,
    tool_queue: VecDeque<ToolInvocation>,
    tool_task: Option<JoinHandle<()>>,
    tool_results_tx: mpsc::Sender<ToolCompletion>,
    tool_results_rx: mpsc::Receiver<ToolCompletion>,
}

impl CallSession {
    pub fn new(
        ctx: SessionContext,
        call_id: Option<String>,
        conn_id: Uuid,
        cancel: CancellationToken,
        telephony: TelephonyLeg,
    ) -> Result<Self, AudioError> {
        let inbound_audio = Transcoder::new(Direction::TelephonyToModel, &ctx.audio_format)?;
        let outbound_audio = Transcoder::new(Direction::ModelToTelephony, &ctx.audio_format)?;
        let (tool_results_tx, tool_results_rx) = mpsc::channel(16);
        Ok(Self {
            ctx,
            call_id,
            conn_id,
            started_at: Utc::now(),
            cancel,
            machine: SessionStateMachine::new(),
            telephony,
            model_tx: None,
            model_guard: None,
            stream_sid: None,
            inbound_seq: SequenceTracker::default(),
            outbound_seq: 0,
            last_media_ms: 0,
            frames_forwarded: 0,
            inbound_audio,
            outbound_audio,
            marks: VecDeque::new(),
            playback: None,
            interrupted_item: None,
            response_active: false,
            resume_pending: false,
            function_names: HashMap::new(),
            tool_queue: VecDeque::new(),
            tool_task: None,
            tool_results_tx,
            tool_results_rx,
        })
    }

    /// Drives the call until either leg ends, then tears both down.
    pub async fn run(mut self) -> CloseReason {
        self.publish_status();
        let reason = match self.establish().await {
            Ok(mut model_rx) => self.relay(&mut model_rx).await,
            Err(reason) => reason,
        };
        self.teardown(&reason);
        reason
    }

    async fn establish(&mut self) -> Result<mpsc::Receiver<ServerEvent>, CloseReason> {
        self.enter(SessionState::ModelConnecting);
        let deadline = Instant::now() + self.ctx.setup_timeout;
        let script = self.resolve_script();

        let connector = self.ctx.connector.clone();
        let connection = self
            .during_setup(async move { connector.connect().await }, deadline)
            .await?
            .map_err(|e| CloseReason::SetupFailed(e.to_string()))?;
        let (model_tx, mut model_rx, guard) = connection.into_channels();
        self.model_tx = Some(model_tx);
        self.model_guard = Some(guard);

        let session = session_config(
            &script,
            &self.ctx.voice,
            &self.ctx.audio_format,
            self.ctx.tools.list_schemas(),
        );
        self.send_model(events::session_update(session)).await?;
        self.during_setup(wait_until_ready(&mut model_rx), deadline)
            .await?
            .map_err(CloseReason::SetupFailed)?;

        self.enter(SessionState::Active);
        info!("Model leg ready");
        self.publish(LogEvent::info("session.active", "Model leg ready"));

        self.send_model(events::system_message(GREETING_PROMPT))
            .await?;
        self.send_model(events::response_create()).await?;
        Ok(model_rx)
    }

    /// Awaits `fut` while still servicing the telephony leg, the supersede
    /// token and the setup deadline.
    async fn during_setup<F: Future>(
        &mut self,
        fut: F,
        deadline: Instant,
    ) -> Result<F::Output, CloseReason> {
        tokio::pin!(fut);
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => SetupStep::Cancelled,
                _ = tokio::time::sleep_until(deadline) => SetupStep::TimedOut,
                out = &mut fut => SetupStep::Done(out),
                frame = self.telephony.frames.recv() => SetupStep::Frame(frame),
            };
            match step {
                SetupStep::Done(out) => return Ok(out),
                SetupStep::Frame(Some(frame)) => self.on_telephony(frame).await?,
                SetupStep::Frame(None) => return Err(CloseReason::TelephonyClosed),
                SetupStep::Cancelled => return Err(CloseReason::Superseded),
                SetupStep::TimedOut => return Err(CloseReason::SetupTimeout),
            }
        }
    }

    async fn relay(&mut self, model_rx: &mut mpsc::Receiver<ServerEvent>) -> CloseReason {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                frame = self.telephony.frames.recv() => Step::Telephony(frame),
                event = model_rx.recv() => Step::Model(event),
                Some(done) = self.tool_results_rx.recv() => Step::Tool(done),
            };
            let result = match step {
                Step::Cancelled => Err(CloseReason::Superseded),
                Step::Telephony(Some(frame)) => self.on_telephony(frame).await,
                Step::Telephony(None) => Err(CloseReason::TelephonyClosed),
                Step::Model(Some(event)) => self.on_model(event).await,
                Step::Model(None) => Err(CloseReason::ModelClosed),
                Step::Tool(done) => self.on_tool_result(done).await,
            };
            if let Err(reason) = result {
                return reason;
            }
        }
    }

    fn resolve_script(&self) -> AgentScript {
        let Some(call_id) = self.call_id.as_deref() else {
            return AgentScript::default();
        };
        match self.ctx.pending.take_if_present(call_id) {
            Some(script) => {
                info!(agent = %script.name, "Applying custom script");
                self.publish(
                    LogEvent::info("config.applied", "Custom script applied")
                        .with_data(json!({"agent": script.name, "custom": true})),
                );
                script
            }
            None => {
                info!("No pending script for call, using defaults");
                self.publish(
                    LogEvent::info("config.applied", "Default script applied")
                        .with_data(json!({"custom": false})),
                );
                AgentScript::default()
            }
        }
    }

    async fn on_telephony(&mut self, frame: TelephonyFrame) -> Result<(), CloseReason> {
        if let Err(e) = self.inbound_seq.accept(frame.sequence_number()) {
            warn!(error = %e, kind = frame.kind(), "Dropping telephony frame");
            self.publish(LogEvent::warn("frame.dropped", e.to_string()));
            return Ok(());
        }

        match frame {
            TelephonyFrame::Connected { protocol, version } => {
                debug!(?protocol, ?version, "Telephony stream connected");
            }
            TelephonyFrame::Start { start, .. } => {
                info!(stream_sid = %start.stream_sid, call_sid = ?start.call_sid, "Media stream started");
                self.publish(
                    LogEvent::info("call.started", "Media stream started").with_data(json!({
                        "streamSid": start.stream_sid,
                        "callSid": start.call_sid,
                    })),
                );
                self.stream_sid = Some(start.stream_sid);
                self.last_media_ms = 0;
            }
            TelephonyFrame::Media { media, .. } => {
                if let Some(ts) = media.timestamp_ms() {
                    self.last_media_ms = ts;
                }
                if !self.machine.is_live() {
                    trace!("Model leg not ready, dropping caller audio");
                    return Ok(());
                }
                match self.inbound_audio.convert(&media.payload) {
                    Ok(Some(audio)) => {
                        self.send_model(events::audio_append(audio)).await?;
                        self.frames_forwarded += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Dropping undecodable caller audio"),
                }
            }
            TelephonyFrame::Mark { mark, .. } => self.on_mark(&mark.name),
            TelephonyFrame::Dtmf { dtmf, .. } => {
                info!(digit = %dtmf.digit, "DTMF received");
                self.publish(
                    LogEvent::info("call.dtmf", format!("Caller pressed {}", dtmf.digit))
                        .with_data(json!({"digit": dtmf.digit})),
                );
            }
            TelephonyFrame::Stop { .. } => {
                info!("Telephony stream stopped");
                return Err(CloseReason::StreamStopped);
            }
        }
        Ok(())
    }

    fn on_mark(&mut self, name: &str) {
        match self.marks.iter().position(|m| m == name) {
            Some(pos) => {
                self.marks.drain(..=pos);
            }
            None => debug!(mark = name, "Ignoring unknown playback mark"),
        }
    }

    async fn on_model(&mut self, event: ServerEvent) -> Result<(), CloseReason> {
        match event {
            ServerEvent::SessionCreated(_) | ServerEvent::SessionUpdated(_) => {
                debug!("Model session acknowledged");
            }
            ServerEvent::InputAudioBufferSpeechStarted(started) => {
                debug!(audio_start_ms = started.audio_start_ms, "Caller speech started");
                self.on_speech_started().await?;
            }
            ServerEvent::InputAudioBufferSpeechStopped(stopped) => {
                debug!(audio_end_ms = stopped.audio_end_ms, "Caller speech stopped");
            }
            ServerEvent::ResponseCreated(_) => {
                trace!("Response started");
                self.response_active = true;
            }
            ServerEvent::ResponseOutputItemAdded(added) => {
                let item = added.item;
                if matches!(item.r#type, Some(ItemType::FunctionCall)) {
                    if let (Some(call_id), Some(name)) = (item.call_id, item.name) {
                        self.function_names.insert(call_id, name);
                    }
                }
            }
            ServerEvent::ResponseAudioDelta(delta) => {
                self.on_audio_delta(delta.item_id, delta.delta).await?;
            }
            ServerEvent::ResponseAudioDone(done) => {
                trace!(item_id = %done.item_id, "Assistant audio finished");
            }
            ServerEvent::ResponseAudioTranscriptDone(done) => {
                self.publish(LogEvent::info("transcript.assistant", done.transcript));
            }
            ServerEvent::ConversationItemInputAudioTranscriptionCompleted(done) => {
                self.publish(LogEvent::info("transcript.caller", done.transcript));
            }
            ServerEvent::ResponseFunctionCallArgumentsDone(done) => {
                // The done event carries no name; it was announced with the item.
                let name = self
                    .function_names
                    .remove(&done.call_id)
                    .unwrap_or_default();
                self.on_function_call(ToolInvocation {
                    call_id: done.call_id,
                    name,
                    arguments: done.arguments,
                });
            }
            ServerEvent::ResponseDone(_) => {
                trace!("Response finished");
                self.response_active = false;
                if self.resume_pending && self.machine.state() == SessionState::Active {
                    self.resume_pending = false;
                    self.send_model(events::response_create()).await?;
                }
            }
            ServerEvent::Error(failure) => {
                let error = failure.error;
                warn!(kind = ?error.r#type, code = ?error.code, message = %error.message, "Model reported an error");
                let data = json!({"type": error.r#type, "code": error.code});
                self.publish(LogEvent::warn("model.error", error.message).with_data(data));
            }
            other => trace!(?other, "Ignoring model event"),
        }
        Ok(())
    }

    async fn on_audio_delta(&mut self, item_id: String, delta: String) -> Result<(), CloseReason> {
        if self.interrupted_item.as_deref() == Some(item_id.as_str()) {
            trace!(%item_id, "Dropping audio of interrupted item");
            return Ok(());
        }
        let Some(stream_sid) = self.stream_sid.clone() else {
            debug!("No media stream yet, dropping assistant audio");
            return Ok(());
        };
        let payload = match self.outbound_audio.convert(&delta) {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable assistant audio");
                return Ok(());
            }
        };

        if self.playback.as_ref().map(|p| p.item_id.as_str()) != Some(item_id.as_str()) {
            self.playback = Some(Playback {
                item_id,
                started_at_ms: self.last_media_ms,
                sent_ms: 0,
            });
        }
        // The telephony leg always carries 8 kHz μ-law.
        let duration = payload_duration_ms(&payload, &AudioFormat::G711ULAW);
        if let Some(playback) = self.playback.as_mut() {
            playback.sent_ms += duration;
        }

        self.send_telephony(OutboundFrame::media(&stream_sid, payload))
            .await?;
        self.outbound_seq += 1;
        let mark = format!("resp-{}", self.outbound_seq);
        self.marks.push_back(mark.clone());
        self.send_telephony(OutboundFrame::mark(&stream_sid, mark))
            .await
    }

    /// Barge-in: stop the response the caller is talking over.
    async fn on_speech_started(&mut self) -> Result<(), CloseReason> {
        if self.marks.is_empty() {
            return Ok(());
        }
        let Some(playback) = self.playback.take() else {
            self.marks.clear();
            return Ok(());
        };
        let audio_end_ms = self
            .last_media_ms
            .saturating_sub(playback.started_at_ms)
            .min(playback.sent_ms);
        info!(item_id = %playback.item_id, audio_end_ms, "Caller barged in");

        if self.response_active {
            self.send_model(events::response_cancel()).await?;
        }
        self.send_model(events::truncate(
            playback.item_id.clone(),
            0,
            u32::try_from(audio_end_ms).unwrap_or(u32::MAX),
        ))
        .await?;
        if let Some(stream_sid) = self.stream_sid.clone() {
            self.send_telephony(OutboundFrame::clear(&stream_sid))
                .await?;
        }

        self.marks.clear();
        self.outbound_audio.reset();
        self.publish(
            LogEvent::info("call.barge_in", "Caller interrupted the assistant")
                .with_data(json!({"itemId": playback.item_id, "audioEndMs": audio_end_ms})),
        );
        self.interrupted_item = Some(playback.item_id);
        Ok(())
    }

    fn on_function_call(&mut self, invocation: ToolInvocation) {
        info!(tool = %invocation.name, call_id = %invocation.call_id, "Model requested a tool");
        self.publish(
            LogEvent::info("tool.requested", format!("Tool {} requested", invocation.name))
                .with_data(json!({"name": invocation.name, "invocationId": invocation.call_id})),
        );
        if self.tool_task.is_some() {
            self.tool_queue.push_back(invocation);
        } else {
            self.enter(SessionState::ToolPending);
            self.spawn_tool(invocation);
        }
    }

    fn spawn_tool(&mut self, invocation: ToolInvocation) {
        let tools = self.ctx.tools.clone();
        let results = self.tool_results_tx.clone();
        let ctx = ToolContext {
            call_id: self.call_id.clone(),
            invocation_id: invocation.call_id.clone(),
        };
        let task = async move {
            let outcome = match parse_arguments(&invocation.arguments) {
                Ok(args) => tools.invoke(&invocation.name, args, &ctx).await,
                Err(e) => ToolOutcome::Failure(ToolError::InvalidArguments(e)),
            };
            // A closed session drops its receiver; the result is discarded.
            let _ = results
                .send(ToolCompletion {
                    call_id: invocation.call_id,
                    name: invocation.name,
                    outcome,
                })
                .await;
        };
        self.tool_task = Some(tokio::spawn(task.in_current_span()));
    }

    async fn on_tool_result(&mut self, done: ToolCompletion) -> Result<(), CloseReason> {
        self.tool_task = None;
        let success = done.outcome.is_success();
        let payload = done.outcome.into_payload();
        info!(tool = %done.name, success, "Tool finished");
        self.publish(
            LogEvent::info("tool.completed", format!("Tool {} finished", done.name)).with_data(
                json!({"name": done.name, "invocationId": done.call_id, "success": success}),
            ),
        );

        self.send_model(events::function_output(done.call_id, payload.to_string()))
            .await?;

        if let Some(next) = self.tool_queue.pop_front() {
            self.spawn_tool(next);
            return Ok(());
        }
        self.enter(SessionState::Active);
        // A later `response.done` resumes instead, unless this one does.
        self.resume_pending = self.response_active;
        if !self.response_active {
            self.send_model(events::response_create()).await?;
        }
        Ok(())
    }

    fn teardown(&mut self, reason: &CloseReason) {
        self.enter(SessionState::Closing);
        if let Some(task) = self.tool_task.take() {
            task.abort();
        }
        self.tool_queue.clear();
        // Dropping the sender lets the model writer send its close frame.
        self.model_tx = None;
        self.model_guard = None;

        let data = json!({
            "reason": reason.as_str(),
            "framesForwarded": self.frames_forwarded,
            "framesSent": self.outbound_seq,
        });
        let event = match reason {
            CloseReason::SetupFailed(detail) => {
                warn!(reason = reason.as_str(), %detail, "Session failed to start");
                LogEvent::error("session.closed", format!("Model leg failed: {detail}"))
            }
            other if other.is_failure() => {
                warn!(reason = other.as_str(), "Session closed on leg failure");
                LogEvent::error("session.closed", "Session closed on leg failure")
            }
            other => {
                info!(reason = other.as_str(), "Session closed");
                LogEvent::info("session.closed", "Session closed")
            }
        };
        self.publish(event.with_data(data));
        self.enter(SessionState::Closed);
    }

    fn enter(&mut self, to: SessionState) {
        match self.machine.transition(to) {
            Ok(from) => {
                debug!(?from, ?to, "Session state changed");
                self.publish_status();
            }
            Err(e) => warn!(error = %e, "Ignoring session transition"),
        }
    }

    fn publish_status(&self) {
        let conn_id = self.conn_id.to_string();
        let state = self.machine.state();
        match state {
            SessionState::Init => {
                self.ctx.status.send_replace(Some(self.status_snapshot()));
            }
            SessionState::Closed => {
                self.ctx.status.send_if_modified(|current| match current {
                    Some(status) if status.conn_id == conn_id => {
                        *current = None;
                        true
                    }
                    _ => false,
                });
            }
            _ => {
                // A superseded session must not overwrite its successor.
                self.ctx.status.send_if_modified(|current| match current {
                    Some(status) if status.conn_id == conn_id => {
                        status.state = state;
                        true
                    }
                    _ => false,
                });
            }
        }
    }

    fn status_snapshot(&self) -> SessionStatus {
        SessionStatus {
            call_id: self.call_id.clone(),
            state: self.machine.state(),
            conn_id: self.conn_id.to_string(),
            started_at: self.started_at,
        }
    }

    fn publish(&self, event: LogEvent) {
        self.ctx
            .logs
            .publish(event.with_call(self.call_id.as_deref()));
    }

    async fn send_model(&self, event: ClientEvent) -> Result<(), CloseReason> {
        let Some(tx) = &self.model_tx else {
            return Err(CloseReason::ModelClosed);
        };
        tx.send(event).await.map_err(|_| CloseReason::ModelClosed)
    }

    async fn send_telephony(&self, frame: OutboundFrame) -> Result<(), CloseReason> {
        self.telephony
            .outbound
            .send(frame)
            .await
            .map_err(|_| CloseReason::TelephonyClosed)
    }
}

/// Waits for the model to acknowledge `session.update`.
async fn wait_until_ready(model_rx: &mut mpsc::Receiver<ServerEvent>) -> Result<(), String> {
    while let Some(event) = model_rx.recv().await {
        match event {
            ServerEvent::SessionUpdated(_) => return Ok(()),
            ServerEvent::Error(failure) => return Err(failure.error.message),
            other => trace!(?other, "Event before session ready"),
        }
    }
    Err("model leg closed during setup".to_string())
}

fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).map_err(|e| format!("arguments are not valid JSON: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::FrameError;
    use async_trait::async_trait;
    use base64::Engine;
    use callrelay_core::{
        agent::DEFAULT_OPENING,
        tools::{
            DemoLog, ParameterSchema, ToolDescriptor, ToolHandler, demo::ScheduleDemoTool,
        },
    };
    use openai_realtime::{RealtimeConnection, RealtimeError, types::SessionResource};
    use tokio::sync::Notify;

    const STEP: Duration = Duration::from_secs(2);

    struct FakeConnector {
        connection: parking_lot::Mutex<Option<RealtimeConnection>>,
    }

    #[async_trait]
    impl ModelConnector for FakeConnector {
        async fn connect(&self) -> Result<RealtimeConnection, RealtimeError> {
            let connection = self.connection.lock().take();
            connection.ok_or_else(|| RealtimeError::Request("connection already used".into()))
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl ModelConnector for RefusingConnector {
        async fn connect(&self) -> Result<RealtimeConnection, RealtimeError> {
            Err(RealtimeError::Request("401 Unauthorized".into()))
        }
    }

    /// A tool that only finishes when the test says so.
    struct GatedTool {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ToolHandler for GatedTool {
        async fn call(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            self.gate.notified().await;
            Ok(json!({"success": true, "answer": 42}))
        }
    }

    struct Harness {
        telephony_tx: mpsc::Sender<TelephonyFrame>,
        telephony_rx: mpsc::Receiver<OutboundFrame>,
        model_in: mpsc::Sender<ServerEvent>,
        model_out: mpsc::Receiver<ClientEvent>,
        cancel: CancellationToken,
        status: watch::Receiver<Option<SessionStatus>>,
        demos: DemoLog,
        gate: Arc<Notify>,
        handle: JoinHandle<CloseReason>,
    }

    struct Options {
        call_id: Option<String>,
        pending: Arc<PendingConfigStore>,
        audio_format: AudioFormat,
        connector: Option<Arc<dyn ModelConnector>>,
    }

    impl Default for Options {
        fn default() -> Self {
            Self {
                call_id: None,
                pending: Arc::new(PendingConfigStore::new(Duration::from_secs(300))),
                audio_format: AudioFormat::G711ULAW,
                connector: None,
            }
        }
    }

    fn registry(demos: DemoLog, gate: Arc<Notify>) -> ToolRegistry {
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry
            .register(
                ScheduleDemoTool::descriptor(),
                Arc::new(ScheduleDemoTool::new(demos)),
            )
            .unwrap();
        registry
            .register(
                ToolDescriptor {
                    name: "slow_lookup".into(),
                    description: "Finishes when released".into(),
                    parameters: ParameterSchema::default(),
                },
                Arc::new(GatedTool { gate }),
            )
            .unwrap();
        registry
    }

    fn spawn_session(options: Options) -> Harness {
        let (client_tx, model_out) = mpsc::channel(64);
        let (model_in, server_rx) = mpsc::channel(64);
        let connection = RealtimeConnection::from_parts(
            client_tx,
            server_rx,
            tokio::spawn(async {}),
            tokio::spawn(async {}),
        );
        let connector = options.connector.unwrap_or_else(|| {
            Arc::new(FakeConnector {
                connection: parking_lot::Mutex::new(Some(connection)),
            })
        });

        let demos = DemoLog::new();
        let gate = Arc::new(Notify::new());
        let (status_tx, status) = watch::channel(None);
        let ctx = SessionContext {
            tools: Arc::new(registry(demos.clone(), gate.clone())),
            pending: options.pending,
            logs: LogChannel::new(),
            connector,
            status: Arc::new(status_tx),
            voice: "alloy".into(),
            audio_format: options.audio_format,
            setup_timeout: Duration::from_secs(10),
        };

        let (telephony_tx, frames) = mpsc::channel(64);
        let (outbound, telephony_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let session = CallSession::new(
            ctx,
            options.call_id,
            Uuid::new_v4(),
            cancel.clone(),
            TelephonyLeg { frames, outbound },
        )
        .unwrap();

        Harness {
            telephony_tx,
            telephony_rx,
            model_in,
            model_out,
            cancel,
            status,
            demos,
            gate,
            handle: tokio::spawn(session.run()),
        }
    }

    fn frame(value: Value) -> TelephonyFrame {
        TelephonyFrame::parse(&value.to_string()).unwrap()
    }

    fn start_frame(seq: u64) -> TelephonyFrame {
        frame(json!({
            "event": "start",
            "sequenceNumber": seq.to_string(),
            "streamSid": "MZ1",
            "start": {"streamSid": "MZ1", "callSid": "CA1", "tracks": ["inbound"]}
        }))
    }

    fn media_frame(seq: u64, timestamp_ms: u64, payload: &str) -> TelephonyFrame {
        frame(json!({
            "event": "media",
            "sequenceNumber": seq.to_string(),
            "streamSid": "MZ1",
            "media": {"track": "inbound", "chunk": seq.to_string(), "timestamp": timestamp_ms.to_string(), "payload": payload}
        }))
    }

    /// 20 ms of μ-law audio filled with one byte value.
    fn ulaw_chunk(fill: u8) -> String {
        base64::engine::general_purpose::STANDARD.encode(vec![fill; 160])
    }

    /// Builds a server event from its wire form.
    fn server_event(value: Value) -> ServerEvent {
        serde_json::from_value(value).expect("server event fixture")
    }

    fn session_updated() -> ServerEvent {
        server_event(json!({"type": "session.updated", "event_id": "evt_s", "session": {}}))
    }

    fn response(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "object": "realtime.response",
            "status": status,
            "status_details": null,
            "output": [],
            "usage": null
        })
    }

    fn response_created(id: &str) -> ServerEvent {
        server_event(json!({
            "type": "response.created",
            "event_id": "evt_rc",
            "response": response(id, "in_progress")
        }))
    }

    fn response_done(id: &str) -> ServerEvent {
        server_event(json!({
            "type": "response.done",
            "event_id": "evt_rd",
            "response": response(id, "completed")
        }))
    }

    fn function_call_added(call_id: &str, name: &str) -> ServerEvent {
        server_event(json!({
            "type": "response.output_item.added",
            "event_id": "evt_ia",
            "response_id": "resp_1",
            "output_index": 0,
            "item": {
                "id": format!("item_{call_id}"),
                "type": "function_call",
                "status": "in_progress",
                "call_id": call_id,
                "name": name,
                "arguments": ""
            }
        }))
    }

    fn function_call_done(call_id: &str, arguments: &str) -> ServerEvent {
        server_event(json!({
            "type": "response.function_call_arguments.done",
            "event_id": "evt_fd",
            "response_id": "resp_1",
            "item_id": format!("item_{call_id}"),
            "output_index": 0,
            "call_id": call_id,
            "arguments": arguments
        }))
    }

    /// Announces a function call and completes its arguments.
    async fn call_tool(h: &Harness, call_id: &str, name: &str, arguments: &str) {
        h.server(function_call_added(call_id, name)).await;
        h.server(function_call_done(call_id, arguments)).await;
    }

    fn audio_delta(item_id: &str, delta: String) -> ServerEvent {
        server_event(json!({
            "type": "response.audio.delta",
            "event_id": "evt_ad",
            "response_id": "resp_1",
            "item_id": item_id,
            "output_index": 0,
            "content_index": 0,
            "delta": delta
        }))
    }

    fn speech_started(audio_start_ms: u64) -> ServerEvent {
        server_event(json!({
            "type": "input_audio_buffer.speech_started",
            "event_id": "evt_ss",
            "audio_start_ms": audio_start_ms,
            "item_id": "item_user"
        }))
    }

    fn model_error(message: &str) -> ServerEvent {
        server_event(json!({
            "type": "error",
            "event_id": "evt_err",
            "error": {
                "type": "invalid_request_error",
                "code": "invalid_value",
                "message": message,
                "param": null,
                "event_id": null
            }
        }))
    }

    fn appended_audio(event: ClientEvent) -> String {
        match event {
            ClientEvent::InputAudioBufferAppend(append) => append.audio,
            other => panic!("expected caller audio, got {other:?}"),
        }
    }

    /// Unpacks a `function_call_output` item into its call id and parsed output.
    fn function_output(event: ClientEvent) -> (String, Value) {
        let ClientEvent::ConversationItemCreate(create) = event else {
            panic!("expected the tool result item, got {event:?}");
        };
        let item = create.item;
        assert!(matches!(item.r#type, Some(ItemType::FunctionCallOutput)));
        let output = serde_json::from_str(item.output.as_deref().unwrap()).unwrap();
        (item.call_id.unwrap(), output)
    }

    fn is_response_create(event: &ClientEvent) -> bool {
        matches!(event, ClientEvent::ResponseCreate(_))
    }

    impl Harness {
        async fn next_model(&mut self) -> ClientEvent {
            tokio::time::timeout(STEP, self.model_out.recv())
                .await
                .expect("timed out waiting for a model event")
                .expect("model leg closed")
        }

        /// Next model event that is not caller audio.
        async fn next_model_control(&mut self) -> ClientEvent {
            loop {
                match self.next_model().await {
                    ClientEvent::InputAudioBufferAppend(_) => continue,
                    other => return other,
                }
            }
        }

        async fn next_telephony(&mut self) -> OutboundFrame {
            tokio::time::timeout(STEP, self.telephony_rx.recv())
                .await
                .expect("timed out waiting for a telephony frame")
                .expect("telephony leg closed")
        }

        async fn server(&self, event: ServerEvent) {
            self.model_in.send(event).await.unwrap();
        }

        async fn caller(&self, frame: TelephonyFrame) {
            self.telephony_tx.send(frame).await.unwrap();
        }

        /// Completes the setup handshake and returns the initialization payload.
        async fn make_ready(&mut self) -> SessionResource {
            let ClientEvent::SessionUpdate(update) = self.next_model().await else {
                panic!("first model event must be session.update");
            };
            self.server(session_updated()).await;
            assert!(matches!(
                self.next_model().await,
                ClientEvent::ConversationItemCreate(_)
            ));
            assert!(is_response_create(&self.next_model().await));
            update.session
        }

        /// Asserts the model leg stays quiet for a moment.
        async fn assert_model_idle(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(50), self.model_out.recv()).await;
            assert!(next.is_err(), "unexpected model event {next:?}");
        }

        async fn wait_for_state(&mut self, state: SessionState) {
            tokio::time::timeout(
                STEP,
                self.status
                    .wait_for(|s| s.as_ref().map(|s| s.state) == Some(state)),
            )
            .await
            .expect("timed out waiting for state")
            .unwrap();
        }

        async fn finish(self) -> CloseReason {
            tokio::time::timeout(STEP, self.handle)
                .await
                .expect("session did not end")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_pending_script_is_consumed_once() {
        let pending = Arc::new(PendingConfigStore::new(Duration::from_secs(300)));
        pending.put(
            "call-1",
            AgentScript {
                name: "Max".into(),
                opening: "Hi, Max from Acme here.".into(),
                goal: "Confirm the delivery window".into(),
                tone: "calm".into(),
            },
        );

        let mut first = spawn_session(Options {
            call_id: Some("call-1".into()),
            pending: pending.clone(),
            ..Default::default()
        });
        let session = first.make_ready().await;
        let instructions = session.instructions.clone().unwrap();
        assert!(instructions.contains("Hi, Max from Acme here."));
        assert!(instructions.contains("Confirm the delivery window"));
        assert!(instructions.contains("calm"));
        let wire = serde_json::to_value(&session).unwrap();
        assert_eq!(wire["voice"], "alloy");
        assert_eq!(wire["input_audio_format"], "g711_ulaw");
        assert_eq!(wire["tools"].as_array().unwrap().len(), 2);
        assert!(pending.is_empty());

        let mut second = spawn_session(Options {
            call_id: Some("call-1".into()),
            pending,
            ..Default::default()
        });
        let session = second.make_ready().await;
        assert!(session.instructions.unwrap().contains(DEFAULT_OPENING));

        first.cancel.cancel();
        second.cancel.cancel();
    }

    #[tokio::test]
    async fn test_caller_audio_is_forwarded_in_order() {
        let mut h = spawn_session(Options::default());
        h.make_ready().await;
        h.caller(start_frame(1)).await;

        for seq in 2..=6u64 {
            h.caller(media_frame(seq, seq * 20, &ulaw_chunk(seq as u8))).await;
        }
        // Late duplicate and garbage payload are both dropped.
        h.caller(media_frame(4, 80, &ulaw_chunk(0xAA))).await;
        h.caller(media_frame(7, 140, "%%%not-base64")).await;
        h.caller(media_frame(8, 160, &ulaw_chunk(8))).await;

        for expected in [2u8, 3, 4, 5, 6, 8] {
            assert_eq!(appended_audio(h.next_model().await), ulaw_chunk(expected));
        }
        h.assert_model_idle().await;
        h.cancel.cancel();
        assert_eq!(h.finish().await, CloseReason::Superseded);
    }

    #[tokio::test]
    async fn test_tool_call_pauses_then_resumes() {
        let mut h = spawn_session(Options {
            call_id: Some("call-7".into()),
            ..Default::default()
        });
        h.make_ready().await;
        h.wait_for_state(SessionState::Active).await;
        h.caller(start_frame(1)).await;

        call_tool(&h, "fc_1", "slow_lookup", "{}").await;
        h.wait_for_state(SessionState::ToolPending).await;

        // Caller audio keeps flowing while the tool is outstanding.
        h.caller(media_frame(2, 20, &ulaw_chunk(1))).await;
        assert_eq!(appended_audio(h.next_model().await), ulaw_chunk(1));
        assert_eq!(
            h.status.borrow().as_ref().map(|s| s.state),
            Some(SessionState::ToolPending)
        );

        h.gate.notify_one();
        let (call_id, output) = function_output(h.next_model().await);
        assert_eq!(call_id, "fc_1");
        assert_eq!(output["answer"], 42);
        assert!(is_response_create(&h.next_model().await));
        h.wait_for_state(SessionState::Active).await;
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_schedule_demo_and_unknown_tool_through_session() {
        let mut h = spawn_session(Options {
            call_id: Some("call-9".into()),
            ..Default::default()
        });
        h.make_ready().await;
        h.caller(start_frame(1)).await;

        call_tool(
            &h,
            "fc_demo",
            "schedule_demo",
            r#"{"preferred_time":"Tomorrow at 3pm","customer_name":"Dana"}"#,
        )
        .await;
        let (call_id, output) = function_output(h.next_model().await);
        assert_eq!(call_id, "fc_demo");
        assert_eq!(output["success"], true);
        assert!(output["demo_id"].as_str().unwrap().starts_with("DEMO-"));
        assert!(output["message"].as_str().unwrap().contains("Tomorrow at 3pm"));
        assert!(is_response_create(&h.next_model().await));
        let demos = h.demos.snapshot();
        assert_eq!(demos.len(), 1);
        assert_eq!(demos[0].call_id.as_deref(), Some("call-9"));

        call_tool(&h, "fc_missing", "launch_rocket", "{}").await;
        let (_, output) = function_output(h.next_model().await);
        assert_eq!(output["success"], false);
        assert_eq!(output["error"]["code"], "tool_not_found");
        assert!(is_response_create(&h.next_model().await));

        // A done event whose item was never announced has no tool name.
        h.server(function_call_done("fc_orphan", "{}")).await;
        let (call_id, output) = function_output(h.next_model().await);
        assert_eq!(call_id, "fc_orphan");
        assert_eq!(output["success"], false);
        assert!(is_response_create(&h.next_model().await));

        // Still relaying after the failed tool.
        h.caller(media_frame(2, 20, &ulaw_chunk(9))).await;
        assert_eq!(appended_audio(h.next_model().await), ulaw_chunk(9));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_tool_result_waits_for_running_response() {
        let mut h = spawn_session(Options::default());
        h.make_ready().await;

        h.server(response_created("resp_1")).await;
        call_tool(&h, "fc_1", "schedule_demo", r#"{"preferred_time":"Friday"}"#).await;
        let (call_id, _) = function_output(h.next_model().await);
        assert_eq!(call_id, "fc_1");
        h.assert_model_idle().await;

        h.server(response_done("resp_1")).await;
        assert!(is_response_create(&h.next_model().await));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_two_tool_calls_in_one_response_resume_once() {
        let mut h = spawn_session(Options::default());
        h.make_ready().await;

        h.server(response_created("resp_1")).await;
        call_tool(&h, "fc_1", "schedule_demo", r#"{"preferred_time":"Friday"}"#).await;
        call_tool(&h, "fc_2", "slow_lookup", "{}").await;
        let (call_id, _) = function_output(h.next_model().await);
        assert_eq!(call_id, "fc_1");

        // The response ends while the second tool is still running.
        h.server(response_done("resp_1")).await;
        h.assert_model_idle().await;

        h.gate.notify_one();
        let (call_id, output) = function_output(h.next_model().await);
        assert_eq!(call_id, "fc_2");
        assert_eq!(output["answer"], 42);
        assert!(is_response_create(&h.next_model().await));
        h.wait_for_state(SessionState::Active).await;

        // The resumed response finishes without triggering another one.
        h.server(response_created("resp_2")).await;
        h.server(response_done("resp_2")).await;
        h.assert_model_idle().await;
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_barge_in_clears_playback() {
        let mut h = spawn_session(Options::default());
        h.make_ready().await;
        h.caller(start_frame(1)).await;
        h.caller(media_frame(2, 1000, &ulaw_chunk(0xFF))).await;

        h.server(response_created("resp_1")).await;
        for _ in 0..2 {
            h.server(audio_delta("item_a", ulaw_chunk(0x11))).await;
        }
        assert_eq!(
            h.next_telephony().await,
            OutboundFrame::media("MZ1", ulaw_chunk(0x11))
        );
        assert_eq!(
            h.next_telephony().await,
            OutboundFrame::mark("MZ1", "resp-1".into())
        );
        assert_eq!(
            h.next_telephony().await,
            OutboundFrame::media("MZ1", ulaw_chunk(0x11))
        );
        assert_eq!(
            h.next_telephony().await,
            OutboundFrame::mark("MZ1", "resp-2".into())
        );

        // The first chunk finished playing.
        h.caller(frame(json!({
            "event": "mark", "sequenceNumber": "3", "streamSid": "MZ1", "mark": {"name": "resp-1"}
        })))
        .await;
        h.caller(media_frame(4, 1100, &ulaw_chunk(0xFF))).await;
        h.server(speech_started(1100)).await;

        assert!(matches!(
            h.next_model_control().await,
            ClientEvent::ResponseCancel(_)
        ));
        let ClientEvent::ConversationItemTruncate(truncate) = h.next_model_control().await else {
            panic!("expected conversation.item.truncate");
        };
        assert_eq!(truncate.item_id, "item_a");
        assert_eq!(truncate.content_index, 0);
        assert_eq!(truncate.audio_end_ms, 40);
        assert_eq!(h.next_telephony().await, OutboundFrame::clear("MZ1"));

        // Leftover audio of the interrupted item never reaches the caller.
        h.server(audio_delta("item_a", ulaw_chunk(0x11))).await;
        h.server(audio_delta("item_b", ulaw_chunk(0x22))).await;
        assert_eq!(
            h.next_telephony().await,
            OutboundFrame::media("MZ1", ulaw_chunk(0x22))
        );
        assert_eq!(
            h.next_telephony().await,
            OutboundFrame::mark("MZ1", "resp-3".into())
        );
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_speech_without_playback_is_not_barge_in() {
        let mut h = spawn_session(Options::default());
        h.make_ready().await;
        h.caller(start_frame(1)).await;
        h.server(speech_started(0)).await;
        h.caller(media_frame(2, 20, &ulaw_chunk(3))).await;
        assert_eq!(appended_audio(h.next_model().await), ulaw_chunk(3));
        assert!(h.telephony_rx.try_recv().is_err());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_stop_frame_tears_down_both_legs() {
        let mut h = spawn_session(Options {
            call_id: Some("call-2".into()),
            ..Default::default()
        });
        h.make_ready().await;
        h.caller(start_frame(1)).await;
        h.caller(frame(json!({
            "event": "stop", "sequenceNumber": "2", "streamSid": "MZ1", "stop": {"callSid": "CA1"}
        })))
        .await;

        let mut status = h.status.clone();
        let mut model_out = std::mem::replace(&mut h.model_out, mpsc::channel(1).1);
        let reason = h.finish().await;
        assert_eq!(reason, CloseReason::StreamStopped);
        assert!(model_out.recv().await.is_none());
        status.wait_for(|s| s.is_none()).await.unwrap();
    }

    #[tokio::test]
    async fn test_model_leg_drop_ends_session() {
        let mut h = spawn_session(Options::default());
        h.make_ready().await;
        let model_in = std::mem::replace(&mut h.model_in, mpsc::channel(1).0);
        drop(model_in);
        let mut telephony_rx = std::mem::replace(&mut h.telephony_rx, mpsc::channel(1).1);
        assert_eq!(h.finish().await, CloseReason::ModelClosed);
        assert!(telephony_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_model_leg_terminates_call() {
        let mut h = spawn_session(Options {
            connector: Some(Arc::new(RefusingConnector)),
            ..Default::default()
        });
        let mut telephony_rx = std::mem::replace(&mut h.telephony_rx, mpsc::channel(1).1);
        let reason = h.finish().await;
        assert!(matches!(reason, CloseReason::SetupFailed(ref m) if m.contains("401")));
        assert!(reason.is_failure());
        assert!(telephony_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_model_rejecting_session_update_fails_setup() {
        let mut h = spawn_session(Options::default());
        assert!(matches!(
            h.next_model().await,
            ClientEvent::SessionUpdate(_)
        ));
        h.server(model_error("Invalid voice")).await;
        assert_eq!(
            h.finish().await,
            CloseReason::SetupFailed("Invalid voice".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_window_expires() {
        let mut h = spawn_session(Options::default());
        assert!(matches!(
            h.next_model().await,
            ClientEvent::SessionUpdate(_)
        ));
        // Frames still get sequence-checked while waiting.
        h.caller(start_frame(1)).await;
        h.caller(media_frame(2, 20, &ulaw_chunk(1))).await;

        let handle = std::mem::replace(&mut h.handle, tokio::spawn(async { CloseReason::Superseded }));
        let reason = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::SetupTimeout);
        assert!(h.model_out.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_supersede_closes_session() {
        let mut h = spawn_session(Options::default());
        h.make_ready().await;
        h.cancel.cancel();
        let mut telephony_rx = std::mem::replace(&mut h.telephony_rx, mpsc::channel(1).1);
        assert_eq!(h.finish().await, CloseReason::Superseded);
        assert!(telephony_rx.recv().await.is_none());
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments("").unwrap(), Value::Null);
        assert_eq!(parse_arguments(r#"{"a":1}"#).unwrap(), json!({"a": 1}));
        assert!(parse_arguments("{oops").is_err());
    }

    #[test]
    fn test_frame_error_is_reported_for_duplicates() {
        let mut tracker = SequenceTracker::default();
        tracker.accept(Some("5")).unwrap();
        assert!(matches!(
            tracker.accept(Some("5")),
            Err(FrameError::OutOfOrder { got: 5, last: 5 })
        ));
    }
}
