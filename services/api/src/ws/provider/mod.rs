//! Opens the model leg of a call.

pub mod openai;

use async_trait::async_trait;
use openai_realtime::{RealtimeConnection, RealtimeError};

pub use openai::{OpenAiConnector, session_config};

/// Something that can open a realtime model connection.
///
/// The server uses [`OpenAiConnector`]; tests substitute in-memory channels.
#[async_trait]
pub trait ModelConnector: Send + Sync {
    async fn connect(&self) -> Result<RealtimeConnection, RealtimeError>;
}
