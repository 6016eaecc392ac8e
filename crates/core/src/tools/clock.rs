use super::{
    registry::{ToolContext, ToolDescriptor, ToolError, ToolHandler},
    schema::{ParamKind, ParameterSchema},
};
use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

pub const TOOL_NAME: &str = "get_current_time";

#[derive(Debug, Deserialize)]
struct GetCurrentTimeArgs {
    timezone_offset_hours: Option<i32>,
}

pub struct GetCurrentTimeTool;

impl GetCurrentTimeTool {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: TOOL_NAME.to_string(),
            description: "Get the current date and time, optionally at a UTC offset.".to_string(),
            parameters: ParameterSchema::new().optional(
                "timezone_offset_hours",
                ParamKind::Integer,
                "Whole-hour offset from UTC, between -12 and 14. Defaults to UTC.",
            ),
        }
    }
}

#[async_trait]
impl ToolHandler for GetCurrentTimeTool {
    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: GetCurrentTimeArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let hours = args.timezone_offset_hours.unwrap_or(0);
        if !(-12..=14).contains(&hours) {
            return Err(ToolError::InvalidArguments(format!(
                "timezone_offset_hours must be between -12 and 14, got {hours}"
            )));
        }
        let offset = FixedOffset::east_opt(hours * 3600)
            .ok_or_else(|| ToolError::InvalidArguments(format!("invalid offset {hours}")))?;
        let now = Utc::now().with_timezone(&offset);
        Ok(json!({
            "success": true,
            "iso": now.to_rfc3339(),
            "spoken": now.format("%-I:%M %p on %A, %B %-d").to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offset_applied() {
        let payload = GetCurrentTimeTool
            .call(json!({"timezone_offset_hours": -5}), &ToolContext::default())
            .await
            .unwrap();
        assert!(payload["iso"].as_str().unwrap().ends_with("-05:00"));
        assert!(payload["spoken"].as_str().unwrap().contains(" on "));
    }

    #[tokio::test]
    async fn test_out_of_range_offset() {
        let err = GetCurrentTimeTool
            .call(json!({"timezone_offset_hours": 20}), &ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_arguments");
    }
}
