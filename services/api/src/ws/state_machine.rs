//! Lifecycle of one call relay session.

use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    ModelConnecting,
    Active,
    ToolPending,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Transition table for [`SessionState`].
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self.state, to),
            (Init, ModelConnecting)
                | (ModelConnecting, Active)
                | (Active, ToolPending)
                | (ToolPending, Active)
                | (Init | ModelConnecting | Active | ToolPending, Closing)
                | (Closing, Closed)
        )
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState, TransitionError> {
        if !self.can_transition(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::ToolPending)
    }
}
