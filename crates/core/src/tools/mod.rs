//! Server-side tools the model can call mid-conversation.

pub mod clock;
pub mod demo;
pub mod registry;
pub mod schema;
pub mod weather;

pub use demo::{DemoLog, DemoStatus, ScheduledDemo};
pub use registry::{
    RegistryError, ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolOutcome, ToolRegistry,
    ToolSchema,
};
pub use schema::{ParamKind, ParameterSchema, ParameterSpec};

use std::{sync::Arc, time::Duration};
use weather::WeatherProvider;

/// Builds the registry with every built-in tool.
pub fn builtin_registry(
    demo_log: DemoLog,
    weather: Arc<dyn WeatherProvider>,
    timeout: Duration,
) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new(timeout);
    registry.register(
        demo::ScheduleDemoTool::descriptor(),
        Arc::new(demo::ScheduleDemoTool::new(demo_log)),
    )?;
    registry.register(
        weather::GetWeatherTool::descriptor(),
        Arc::new(weather::GetWeatherTool::new(weather)),
    )?;
    registry.register(
        clock::GetCurrentTimeTool::descriptor(),
        Arc::new(clock::GetCurrentTimeTool),
    )?;
    Ok(registry)
}
