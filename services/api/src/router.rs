//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, the `/call` and `/logs` WebSocket endpoints, and
//! OpenAPI documentation.

use crate::{
    handlers,
    models::{
        CreateCallPayload, CreateCallResponse, DemoInfo, ErrorResponse, InvokeToolPayload,
        ScriptPayload, ToolInfo,
    },
    state::AppState,
    ws::{
        gateway::{call_ws_handler, logs_ws_handler},
        session::SessionStatus,
        state_machine::SessionState,
    },
};

use axum::{Router, http::StatusCode, routing::get, routing::post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_tools,
        handlers::invoke_tool,
        handlers::create_call,
        handlers::twiml,
        handlers::list_demos,
        handlers::current_session,
    ),
    components(
        schemas(ToolInfo, InvokeToolPayload, CreateCallPayload, ScriptPayload, CreateCallResponse, DemoInfo, SessionStatus, SessionState, ErrorResponse)
    ),
    tags(
        (name = "Call Relay API", description = "Telephony to realtime-model call relay")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/tools", get(handlers::list_tools))
        .route("/tools/{name}/invoke", post(handlers::invoke_tool))
        .route("/calls", post(handlers::create_call))
        .route("/twiml", get(handlers::twiml).post(handlers::twiml))
        .route("/demos", get(handlers::list_demos))
        .route("/sessions/current", get(handlers::current_session))
        .route("/call", get(call_ws_handler))
        .route("/logs", get(logs_ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Create the final router that merges the stateful routes
    // with the stateless routes (like Swagger UI).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .layer(TraceLayer::new_for_http())
}
