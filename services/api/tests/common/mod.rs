#![allow(dead_code)]

use async_trait::async_trait;
use callrelay_api::{
    config::Config,
    router::create_router,
    state::AppState,
    telephony::{DialError, Dialer, OutboundCall},
    ws::provider::ModelConnector,
};
use callrelay_core::tools::{
    DemoLog, ToolRegistry, clock::GetCurrentTimeTool, demo::ScheduleDemoTool,
};
use openai_realtime::{
    RealtimeConnection, RealtimeError,
    types::{AudioFormat, ClientEvent, ServerEvent},
};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;

pub const ALLOWED_ORIGIN: &str = "https://dashboard.example.com";

pub fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        public_base_url: "https://relay.example.com".into(),
        openai_api_key: SecretString::from("sk-test"),
        realtime_model: "gpt-4o-realtime-preview".into(),
        realtime_voice: "alloy".into(),
        model_audio_format: AudioFormat::G711ULAW,
        twilio_account_sid: "AC123".into(),
        twilio_auth_token: SecretString::from("token"),
        allowed_origins: vec![ALLOWED_ORIGIN.into()],
        allowed_origin_patterns: vec![r"https://[a-z0-9-]+\.preview\.example\.com".into()],
        pending_config_ttl: Duration::from_secs(300),
        session_setup_timeout: Duration::from_secs(5),
        tool_timeout: Duration::from_secs(2),
        log_level: tracing::Level::DEBUG,
    }
}

/// The far end of a model leg handed out by [`ScriptedConnector`].
pub struct ModelPeer {
    pub from_session: mpsc::Receiver<ClientEvent>,
    pub to_session: mpsc::Sender<ServerEvent>,
}

impl ModelPeer {
    pub async fn next(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(2), self.from_session.recv())
            .await
            .expect("timed out waiting for a client event")
            .expect("model leg closed")
    }

    pub async fn send(&self, event: ServerEvent) {
        self.to_session.send(event).await.unwrap();
    }

    /// Sends a server event given in its wire form.
    pub async fn send_wire(&self, value: Value) {
        let event = serde_json::from_value(value).expect("server event fixture");
        self.send(event).await;
    }

    pub async fn session_updated(&self) {
        self.send_wire(json!({"type": "session.updated", "event_id": "evt_s", "session": {}}))
            .await;
    }

    pub async fn audio_delta(&self, item_id: &str, delta: &str) {
        self.send_wire(json!({
            "type": "response.audio.delta",
            "event_id": "evt_ad",
            "response_id": "resp_1",
            "item_id": item_id,
            "output_index": 0,
            "content_index": 0,
            "delta": delta
        }))
        .await;
    }
}

/// Hands out one pre-built connection.
pub struct ScriptedConnector {
    connection: Mutex<Option<RealtimeConnection>>,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, ModelPeer) {
        let (client_tx, client_rx) = mpsc::channel(64);
        let (server_tx, server_rx) = mpsc::channel(64);
        let connection = RealtimeConnection::from_parts(
            client_tx,
            server_rx,
            tokio::spawn(async {}),
            tokio::spawn(async {}),
        );
        let connector = Arc::new(Self {
            connection: Mutex::new(Some(connection)),
        });
        let peer = ModelPeer {
            from_session: client_rx,
            to_session: server_tx,
        };
        (connector, peer)
    }
}

#[async_trait]
impl ModelConnector for ScriptedConnector {
    async fn connect(&self) -> Result<RealtimeConnection, RealtimeError> {
        self.connection
            .lock()
            .take()
            .ok_or_else(|| RealtimeError::Request("connection already used".into()))
    }
}

/// Never finishes connecting, so sessions stay in setup.
pub struct HangingConnector;

#[async_trait]
impl ModelConnector for HangingConnector {
    async fn connect(&self) -> Result<RealtimeConnection, RealtimeError> {
        std::future::pending().await
    }
}

/// Records dial attempts and answers with a fixed result.
pub struct RecordingDialer {
    pub calls: Mutex<Vec<OutboundCall>>,
    reject: bool,
}

impl RecordingDialer {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reject: false,
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reject: true,
        })
    }
}

#[async_trait]
impl Dialer for RecordingDialer {
    async fn dial(&self, call: &OutboundCall) -> Result<String, DialError> {
        self.calls.lock().push(call.clone());
        if self.reject {
            return Err(DialError::Rejected {
                status: 400,
                message: "The 'To' number is not a valid phone number.".into(),
            });
        }
        Ok("CA0123456789".into())
    }
}

pub fn test_state(connector: Arc<dyn ModelConnector>, dialer: Arc<dyn Dialer>) -> Arc<AppState> {
    let demos = DemoLog::new();
    let mut tools = ToolRegistry::new(Duration::from_secs(2));
    tools
        .register(
            ScheduleDemoTool::descriptor(),
            Arc::new(ScheduleDemoTool::new(demos.clone())),
        )
        .unwrap();
    tools
        .register(GetCurrentTimeTool::descriptor(), Arc::new(GetCurrentTimeTool))
        .unwrap();
    Arc::new(AppState::new(test_config(), tools, demos, connector, dialer).unwrap())
}

/// Serves the router on an ephemeral port.
pub async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
