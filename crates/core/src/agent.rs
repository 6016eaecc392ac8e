//! Agent Script
//!
//! The persona a call session speaks with: who the agent is, how it opens the
//! call, what it is trying to achieve and in what tone. Outbound calls may carry
//! a custom script; everything else falls back to [`AgentScript::default`].

use serde::{Deserialize, Serialize};

pub const DEFAULT_NAME: &str = "Ava";
pub const DEFAULT_OPENING: &str =
    "Hi, this is Ava from the scheduling team. Do you have a minute to talk?";
pub const DEFAULT_GOAL: &str = "Find out what the caller needs and, if they are interested, \
     book a product demo at a time that works for them.";
pub const DEFAULT_TONE: &str = "friendly and professional";

/// The effective agent configuration of one call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentScript {
    pub name: String,
    pub opening: String,
    pub goal: String,
    pub tone: String,
}

impl Default for AgentScript {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            opening: DEFAULT_OPENING.to_string(),
            goal: DEFAULT_GOAL.to_string(),
            tone: DEFAULT_TONE.to_string(),
        }
    }
}

impl AgentScript {
    /// Renders the system instructions sent in the model's initialization event.
    pub fn instructions(&self) -> String {
        format!(
            "You are {name}, a voice agent speaking with someone over a live phone call.\n\
             Begin the conversation by saying: \"{opening}\"\n\
             Your goal: {goal}\n\
             Tone: speak in a {tone} manner.\n\
             Keep every reply short and conversational; this is audio, so never use \
             lists, markdown or emoji. If the caller interrupts, stop and listen. \
             Use the available tools when the caller asks for something they cover, \
             and tell the caller briefly what you are doing while you wait for a result.",
            name = self.name,
            opening = self.opening,
            goal = self.goal,
            tone = self.tone,
        )
    }
}

/// A possibly incomplete script, as submitted with an outbound call request.
///
/// Missing or blank fields take their default value.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOverrides {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub opening: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
}

impl ScriptOverrides {
    pub fn is_empty(&self) -> bool {
        [&self.name, &self.opening, &self.goal, &self.tone]
            .iter()
            .all(|field| non_blank(field).is_none())
    }

    pub fn into_script(self) -> AgentScript {
        let defaults = AgentScript::default();
        AgentScript {
            name: non_blank(&self.name).unwrap_or(defaults.name),
            opening: non_blank(&self.opening).unwrap_or(defaults.opening),
            goal: non_blank(&self.goal).unwrap_or(defaults.goal),
            tone: non_blank(&self.tone).unwrap_or(defaults.tone),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
