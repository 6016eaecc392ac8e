//! API Models
//!
//! Request and response bodies of the REST surface, annotated for `utoipa`.

use callrelay_core::{
    ScriptOverrides,
    tools::{DemoStatus, ScheduledDemo, ToolSchema},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A custom agent script submitted with an outbound call.
#[derive(Deserialize, ToSchema, Debug, Clone, Default)]
pub struct ScriptPayload {
    #[schema(example = "Max")]
    pub name: Option<String>,
    #[schema(example = "Hi, this is Max from Acme. Do you have a minute?")]
    pub opening: Option<String>,
    #[schema(example = "Book a product demo")]
    pub goal: Option<String>,
    #[schema(example = "warm and concise")]
    pub tone: Option<String>,
}

impl From<ScriptPayload> for ScriptOverrides {
    fn from(payload: ScriptPayload) -> Self {
        ScriptOverrides {
            name: payload.name,
            opening: payload.opening,
            goal: payload.goal,
            tone: payload.tone,
        }
    }
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct CreateCallPayload {
    /// Destination number in E.164 form.
    #[schema(example = "+15551234567")]
    pub to: String,
    /// Caller id in E.164 form.
    #[schema(example = "+15557654321")]
    pub from: String,
    pub script: Option<ScriptPayload>,
}

#[derive(Serialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallResponse {
    pub call_id: String,
    pub call_sid: String,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct ToolInfo {
    #[schema(example = "schedule_demo")]
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments.
    #[schema(value_type = Object)]
    pub parameters: Value,
}

impl From<ToolSchema> for ToolInfo {
    fn from(schema: ToolSchema) -> Self {
        Self {
            name: schema.name,
            description: schema.description,
            parameters: schema.parameters,
        }
    }
}

#[derive(Deserialize, ToSchema, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InvokeToolPayload {
    /// Tool arguments; omitted means no arguments.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub arguments: Value,
    /// Call to attribute the invocation to.
    pub call_id: Option<String>,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DemoInfo {
    #[schema(example = "DEMO-1A2B3C4D")]
    pub id: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub requested_time: String,
    pub call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[schema(value_type = String, example = "pending")]
    pub status: DemoStatus,
}

impl From<ScheduledDemo> for DemoInfo {
    fn from(demo: ScheduledDemo) -> Self {
        Self {
            id: demo.id,
            customer_name: demo.customer_name,
            customer_email: demo.customer_email,
            customer_phone: demo.customer_phone,
            requested_time: demo.requested_time,
            call_id: demo.call_id,
            created_at: demo.created_at,
            status: demo.status,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

/// Numbers must look like E.164: a `+` then 8 to 15 digits.
pub fn is_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_e164() {
        assert!(is_e164("+15551234567"));
        assert!(is_e164("+442071838750"));
        assert!(!is_e164("15551234567"));
        assert!(!is_e164("+1555"));
        assert!(!is_e164("+1-555-123-4567"));
        assert!(!is_e164("+05551234567"));
        assert!(!is_e164(""));
    }

    #[test]
    fn test_create_call_payload_deserialization() {
        let payload: CreateCallPayload = serde_json::from_value(json!({
            "to": "+15551234567",
            "from": "+15557654321",
            "script": {"opening": "Hello there", "tone": "upbeat"}
        }))
        .unwrap();
        let overrides: ScriptOverrides = payload.script.unwrap().into();
        let script = overrides.into_script();
        assert_eq!(script.opening, "Hello there");
        assert_eq!(script.tone, "upbeat");
        assert_eq!(script.name, callrelay_core::agent::DEFAULT_NAME);
    }

    #[test]
    fn test_create_call_response_is_camel_case() {
        let value = serde_json::to_value(CreateCallResponse {
            call_id: "c1".into(),
            call_sid: "CA1".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"callId": "c1", "callSid": "CA1"}));
    }

    #[test]
    fn test_invoke_payload_defaults() {
        let payload: InvokeToolPayload = serde_json::from_value(json!({})).unwrap();
        assert_eq!(payload.arguments, Value::Null);
        assert!(payload.call_id.is_none());
    }
}
