//! Demo scheduling tool and the in-memory demo log it appends to.

use super::{
    registry::{ToolContext, ToolDescriptor, ToolError, ToolHandler},
    schema::{ParamKind, ParameterSchema},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const TOOL_NAME: &str = "schedule_demo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemoStatus {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledDemo {
    pub id: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub requested_time: String,
    /// The call the demo was booked on, when booked by a live session.
    pub call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: DemoStatus,
}

/// Append-only log of scheduled demos, shared by every session.
#[derive(Clone, Default)]
pub struct DemoLog {
    entries: Arc<RwLock<Vec<ScheduledDemo>>>,
}

impl DemoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, demo: ScheduledDemo) {
        self.entries.write().push(demo);
    }

    pub fn snapshot(&self) -> Vec<ScheduledDemo> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleDemoArgs {
    preferred_time: String,
    customer_name: Option<String>,
    customer_email: Option<String>,
    customer_phone: Option<String>,
}

pub struct ScheduleDemoTool {
    log: DemoLog,
}

impl ScheduleDemoTool {
    pub fn new(log: DemoLog) -> Self {
        Self { log }
    }

    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: TOOL_NAME.to_string(),
            description: "Schedule a product demo for the caller at their preferred time."
                .to_string(),
            parameters: ParameterSchema::new()
                .required(
                    "preferred_time",
                    ParamKind::String,
                    "When the caller would like the demo, in their own words (e.g. 'Tomorrow at 3pm').",
                )
                .optional("customer_name", ParamKind::String, "The caller's name.")
                .optional("customer_email", ParamKind::String, "Email for the invitation.")
                .optional("customer_phone", ParamKind::String, "Callback phone number."),
        }
    }
}

fn new_demo_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("DEMO-{}", hex[..8].to_uppercase())
}

#[async_trait]
impl ToolHandler for ScheduleDemoTool {
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: ScheduleDemoArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let requested_time = args.preferred_time.trim().to_string();
        if requested_time.is_empty() {
            return Err(ToolError::InvalidArguments(
                "preferred_time must not be empty".to_string(),
            ));
        }

        let demo = ScheduledDemo {
            id: new_demo_id(),
            customer_name: args.customer_name,
            customer_email: args.customer_email,
            customer_phone: args.customer_phone,
            requested_time,
            call_id: ctx.call_id.clone(),
            created_at: Utc::now(),
            status: DemoStatus::Pending,
        };

        let mut message = format!("Demo scheduled for {}.", demo.requested_time);
        match (&demo.customer_name, &demo.customer_email) {
            (Some(name), Some(email)) => {
                message.push_str(&format!(" {name}, a confirmation will be sent to {email}."))
            }
            (None, Some(email)) => {
                message.push_str(&format!(" A confirmation will be sent to {email}."))
            }
            _ => message.push_str(" Our team will reach out to confirm."),
        }

        info!(demo_id = %demo.id, requested_time = %demo.requested_time, "Demo scheduled");
        let payload = json!({
            "success": true,
            "demo_id": demo.id,
            "requested_time": demo.requested_time,
            "message": message,
        });
        self.log.append(demo);
        Ok(payload)
    }
}
