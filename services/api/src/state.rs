//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the process-wide
//! collaborators: the tool registry, the pending-script store, the gateway's
//! session registry and log channel, and the outbound clients.

use crate::{
    config::Config,
    telephony::Dialer,
    ws::{
        gateway::{OriginPolicy, SessionRegistry},
        logs::LogChannel,
        provider::ModelConnector,
        session::{SessionContext, SessionStatus},
    },
};
use callrelay_core::{PendingConfigStore, tools::DemoLog, tools::ToolRegistry};
use std::sync::Arc;
use tokio::sync::watch;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub pending: Arc<PendingConfigStore>,
    pub demos: DemoLog,
    pub origins: OriginPolicy,
    pub registry: Arc<SessionRegistry>,
    pub logs: LogChannel,
    pub connector: Arc<dyn ModelConnector>,
    pub dialer: Arc<dyn Dialer>,
    pub session_status: Arc<watch::Sender<Option<SessionStatus>>>,
}

impl AppState {
    /// Wires the state from its parts; the origin policy comes from `config`.
    pub fn new(
        config: Config,
        tools: ToolRegistry,
        demos: DemoLog,
        connector: Arc<dyn ModelConnector>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, regex::Error> {
        let origins = OriginPolicy::new(
            config.allowed_origins.clone(),
            &config.allowed_origin_patterns,
        )?;
        let pending = Arc::new(PendingConfigStore::new(config.pending_config_ttl));
        let (session_status, _) = watch::channel(None);
        Ok(Self {
            config: Arc::new(config),
            tools: Arc::new(tools),
            pending,
            demos,
            origins,
            registry: Arc::new(SessionRegistry::new()),
            logs: LogChannel::new(),
            connector,
            dialer,
            session_status: Arc::new(session_status),
        })
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            tools: self.tools.clone(),
            pending: self.pending.clone(),
            logs: self.logs.clone(),
            connector: self.connector.clone(),
            status: self.session_status.clone(),
            voice: self.config.realtime_voice.clone(),
            audio_format: self.config.model_audio_format.clone(),
            setup_timeout: self.config.session_setup_timeout,
        }
    }
}
