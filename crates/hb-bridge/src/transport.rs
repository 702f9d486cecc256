//! HTTP transport: one route at `/` carrying JSON-RPC over POST.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hb_harness::dispatcher::Dispatcher;
use hb_harness::mcp::{error_codes, JsonRpcRequest, JsonRpcResponse};
use hb_telemetry::tracing_setup::request_id_middleware;
use serde_json::{json, Value};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, warn};

pub const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";
pub const ALLOWED_HEADERS: &str = "Content-Type";

/// Build the service router. Every response carries
/// `Access-Control-Allow-Origin: *`.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", get(health).post(rpc).options(preflight))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .with_state(dispatcher)
}

async fn health(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Value> {
    let identity = dispatcher.identity();
    Json(json!({
        "status": "running",
        "server": identity.name,
        "protocol_version": identity.protocol_version,
    }))
}

async fn preflight() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS),
        ],
    )
}

async fn rpc(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(reply) => {
            warn!(code = ?reply.error.as_ref().map(|e| e.code), "rejected request body");
            return (StatusCode::BAD_REQUEST, Json(reply)).into_response();
        }
    };

    // Tools block on model I/O; keep them off the async workers.
    match tokio::task::spawn_blocking(move || dispatcher.dispatch(&request)).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => {
            error!(error = %e, "dispatch task failed");
            let reply = JsonRpcResponse::error(None, error_codes::INTERNAL_ERROR, "dispatch task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(reply)).into_response()
        }
    }
}

/// Decode a POST body. Malformed JSON is a parse error with a null id;
/// well-formed JSON that is not a request object is an invalid request.
pub fn parse_request(body: &[u8]) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        JsonRpcResponse::error(None, error_codes::PARSE_ERROR, format!("Parse error: {e}"))
    })?;
    let id = value.get("id").filter(|v| !v.is_null()).cloned();
    serde_json::from_value(value).map_err(|e| {
        JsonRpcResponse::error(id, error_codes::INVALID_REQUEST, format!("Invalid request: {e}"))
    })
}
