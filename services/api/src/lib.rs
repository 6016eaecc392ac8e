//! Call Relay API Library Crate
//!
//! This library contains the web service that bridges phone calls to a
//! realtime model: configuration, application state, REST handlers, the
//! WebSocket gateway and call relay session, audio transcoding, and routing.
//! The `api` binary is a thin wrapper around this library.

pub mod audio_utils;
pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod telephony;
pub mod ws;
