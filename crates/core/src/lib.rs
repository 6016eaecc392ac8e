//! Domain logic for the call relay: agent scripts, the pending-script store
//! and the tool registry with its built-in tools. Nothing here knows about
//! HTTP or websockets.

pub mod agent;
pub mod pending;
pub mod tools;

pub use agent::{AgentScript, ScriptOverrides};
pub use pending::{ExpiringCache, PendingConfigStore};
