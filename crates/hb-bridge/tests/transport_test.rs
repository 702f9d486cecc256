use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use hb_bridge::transport::router;
use hb_core::state::StateStore;
use hb_harness::dispatcher::{Dispatcher, ServerIdentity};
use hb_harness::mcp::{McpTool, ToolError, ToolHandler, ToolOutput, ToolRegistry};
use serde_json::{json, Map, Value};
use tower::ServiceExt;

struct EchoTool;

impl ToolHandler for EchoTool {
    fn descriptor(&self) -> McpTool {
        McpTool {
            name: "echo".into(),
            description: "Echo the symptoms back".into(),
            input_schema: json!({"type": "object", "properties": {"symptoms": {"type": "string"}}}),
            annotations: None,
        }
    }

    fn call(&self, arguments: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let symptoms = arguments.get("symptoms").and_then(Value::as_str).unwrap_or_default();
        Ok(ToolOutput::text(symptoms))
    }
}

fn app() -> (axum::Router, Arc<StateStore>) {
    let state = Arc::new(StateStore::new(8081));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    let identity = ServerIdentity {
        name: "LocalMedicalContextServer".into(),
        version: "1.0.0".into(),
        protocol_version: "2025-06-18".into(),
    };
    let dispatcher = Arc::new(Dispatcher::new(identity, registry, state.clone()));
    (router(dispatcher), state)
}

fn post(body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn get_reports_health() {
    let (app, _) = app();
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "running");
    assert_eq!(body["server"], "LocalMedicalContextServer");
    assert_eq!(body["protocol_version"], "2025-06-18");
}

#[tokio::test]
async fn post_initialize_round_trip() {
    let (app, state) = app();
    let response = app
        .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["serverInfo"]["name"], "LocalMedicalContextServer");
    assert_eq!(state.log_count(), 1);
}

#[tokio::test]
async fn post_tool_call_returns_text_content() {
    let (app, _) = app();
    let response = app
        .oneshot(post(
            r#"{"jsonrpc":"2.0","id":"t1","method":"tools/call","params":{"name":"echo","arguments":{"symptoms":"headache"}}}"#,
        ))
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["id"], "t1");
    assert_eq!(body["result"]["content"][0]["text"], "headache");
}

#[tokio::test]
async fn malformed_body_is_parse_error_and_not_logged() {
    let (app, state) = app();
    let response = app.oneshot(post("{\"jsonrpc\": ")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], Value::Null);
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(state.log_count(), 0);
}

#[tokio::test]
async fn unknown_method_is_still_http_ok() {
    let (app, _) = app();
    let response = app
        .oneshot(post(r#"{"jsonrpc":"2.0","id":7,"method":"prompts/list"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["id"], 7);
}

#[tokio::test]
async fn options_returns_cors_headers() {
    let (app, _) = app();
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
        "GET, POST, OPTIONS"
    );
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(), "Content-Type");
}
