//! Real-time connections.
//!
//! - `gateway`: origin admission, the single-slot registry and the socket endpoints.
//! - `session`: the call relay session between the telephony and model legs.
//! - `protocol`: telephony media-stream frames.
//! - `state_machine`: session lifecycle states and legal transitions.
//! - `logs`: the log broadcast channel.
//! - `provider`: opens the model leg.

pub mod gateway;
pub mod logs;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod state_machine;

pub use gateway::{call_ws_handler, logs_ws_handler};
