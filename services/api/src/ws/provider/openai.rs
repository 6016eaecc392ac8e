//! OpenAI Realtime model leg.

use super::ModelConnector;
use async_trait::async_trait;
use callrelay_core::{AgentScript, tools::ToolSchema};
use openai_realtime::{
    RealtimeConfig, RealtimeConnection, RealtimeError,
    types::{AudioFormat, AudioTranscription, SessionResource, TurnDetection},
};
use serde_json::json;
use tracing::{info, warn};

pub struct OpenAiConnector {
    config: RealtimeConfig,
}

impl OpenAiConnector {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ModelConnector for OpenAiConnector {
    async fn connect(&self) -> Result<RealtimeConnection, RealtimeError> {
        info!(model = %self.config.model, "Opening model leg");
        openai_realtime::connect(&self.config).await
    }
}

/// Builds the `session.update` payload that primes a call.
///
/// Voices the API does not know are left unset so the session keeps its default.
pub fn session_config(
    script: &AgentScript,
    voice: &str,
    audio_format: &AudioFormat,
    tools: Vec<ToolSchema>,
) -> SessionResource {
    let voice = serde_json::from_value(json!(voice)).ok();
    if voice.is_none() {
        warn!("Unknown realtime voice, using the session default");
    }
    let tools: Vec<_> = tools
        .into_iter()
        .map(|tool| {
            json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            })
        })
        .collect();
    let has_tools = !tools.is_empty();

    SessionResource {
        modalities: Some(vec!["text".to_string(), "audio".to_string()]),
        instructions: Some(script.instructions()),
        voice,
        input_audio_format: Some(audio_format.clone()),
        output_audio_format: Some(audio_format.clone()),
        input_audio_transcription: Some(AudioTranscription {
            model: Some("whisper-1".to_string()),
            ..Default::default()
        }),
        turn_detection: Some(TurnDetection::ServerVAD {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            interrupt_response: Some(true),
            create_response: Some(true),
        }),
        tools: if has_tools {
            serde_json::from_value(json!(tools)).ok()
        } else {
            None
        },
        tool_choice: if has_tools {
            serde_json::from_value(json!("auto")).ok()
        } else {
            None
        },
        ..Default::default()
    }
}
