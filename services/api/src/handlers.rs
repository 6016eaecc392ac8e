//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests: tool discovery and
//! invocation, call initiation and the call-setup document, and read-only views
//! of the demo log and the live session. It uses `utoipa` doc comments to
//! generate OpenAPI documentation.

use axum::{
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use callrelay_core::{ScriptOverrides, tools::ToolContext};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::IntoParams;
use uuid::Uuid;

use crate::{
    models::{
        CreateCallPayload, CreateCallResponse, DemoInfo, ErrorResponse, InvokeToolPayload,
        ToolInfo, is_e164,
    },
    state::AppState,
    telephony::{OutboundCall, render_twiml},
    ws::{logs::LogEvent, session::SessionStatus},
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    BadGateway(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::BadGateway(message) => {
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct TwimlQuery {
    /// Call id to hand to the media stream.
    #[serde(rename = "callId")]
    pub call_id: Option<String>,
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = String))
)]
pub async fn health() -> &'static str {
    "ok"
}

/// List every tool the model can call.
#[utoipa::path(
    get,
    path = "/tools",
    responses((status = 200, description = "Tool catalog", body = [ToolInfo]))
)]
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolInfo>> {
    Json(
        state
            .tools
            .list_schemas()
            .into_iter()
            .map(ToolInfo::from)
            .collect(),
    )
}

/// Run a tool outside of a call.
///
/// The response body is exactly what the model would receive, including
/// structured error payloads for unknown tools or bad arguments.
#[utoipa::path(
    post,
    path = "/tools/{name}/invoke",
    request_body = InvokeToolPayload,
    responses((status = 200, description = "Tool result or structured error payload")),
    params(("name" = String, Path, description = "Tool name"))
)]
pub async fn invoke_tool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<InvokeToolPayload>,
) -> Json<Value> {
    let ctx = ToolContext {
        call_id: payload.call_id,
        invocation_id: format!("http-{}", Uuid::new_v4()),
    };
    let outcome = state.tools.invoke(&name, payload.arguments, &ctx).await;
    info!(tool = %name, success = outcome.is_success(), "Tool invoked over HTTP");
    Json(outcome.into_payload())
}

/// Place an outbound call, optionally with a custom agent script.
#[utoipa::path(
    post,
    path = "/calls",
    request_body = CreateCallPayload,
    responses(
        (status = 201, description = "Call placed", body = CreateCallResponse),
        (status = 400, description = "Invalid phone number", body = ErrorResponse),
        (status = 502, description = "Telephony provider refused the call", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_call(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCallPayload>,
) -> Result<impl IntoResponse, ApiError> {
    for (field, number) in [("to", &payload.to), ("from", &payload.from)] {
        if !is_e164(number) {
            return Err(ApiError::BadRequest(format!(
                "'{field}' must be an E.164 number like +15551234567"
            )));
        }
    }

    let call_id = Uuid::new_v4().to_string();
    let overrides: ScriptOverrides = payload.script.map(Into::into).unwrap_or_default();
    let custom = !overrides.is_empty();
    if custom {
        state.pending.put(call_id.clone(), overrides.into_script());
    }

    let call = OutboundCall {
        to: payload.to,
        from: payload.from,
        setup_url: format!(
            "{}/twiml?callId={}",
            state.config.public_base_url, call_id
        ),
    };
    let call_sid = match state.dialer.dial(&call).await {
        Ok(sid) => sid,
        Err(e) => {
            state.pending.remove(&call_id);
            warn!(error = %e, %call_id, "Outbound dial failed");
            state.logs.publish(
                LogEvent::error("call.dial_failed", e.to_string()).with_call(Some(&call_id)),
            );
            return Err(ApiError::BadGateway(e.to_string()));
        }
    };

    info!(%call_id, %call_sid, custom, "Outbound call initiated");
    state.logs.publish(
        LogEvent::info("call.initiated", format!("Dialing {}", call.to))
            .with_call(Some(&call_id))
            .with_data(json!({"callSid": call_sid, "customScript": custom})),
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateCallResponse { call_id, call_sid }),
    ))
}

/// Call-setup document that connects the answered call to `/call`.
#[utoipa::path(
    get,
    path = "/twiml",
    params(TwimlQuery),
    responses((status = 200, description = "TwiML document", content_type = "text/xml", body = String))
)]
pub async fn twiml(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TwimlQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let call_id = query.call_id.filter(|id| !id.trim().is_empty());
    let document = render_twiml(&state.config.public_ws_base(), call_id.as_deref())?;
    Ok(([(header::CONTENT_TYPE, "text/xml")], document))
}

/// Demos booked so far by this process.
#[utoipa::path(
    get,
    path = "/demos",
    responses((status = 200, description = "Scheduled demos", body = [DemoInfo]))
)]
pub async fn list_demos(State(state): State<Arc<AppState>>) -> Json<Vec<DemoInfo>> {
    Json(
        state
            .demos
            .snapshot()
            .into_iter()
            .map(DemoInfo::from)
            .collect(),
    )
}

/// The live call relay session, if any.
#[utoipa::path(
    get,
    path = "/sessions/current",
    responses(
        (status = 200, description = "Current session", body = SessionStatus),
        (status = 404, description = "No call in progress", body = ErrorResponse)
    )
)]
pub async fn current_session(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionStatus>, ApiError> {
    let status = state.session_status.borrow().clone();
    status
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No call in progress".to_string()))
}
