//! JSON-RPC method routing for the MCP server.
//!
//! The dispatcher is stateless per request. Each call to [`Dispatcher::dispatch`]
//! appends exactly one entry to the request log and updates it exactly once
//! when the response is known, whatever the outcome.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use hb_core::state::{RequestLogEntry, RequestLogUpdate, StateStore};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::mcp::{
    error_codes, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ServerCapabilities, ServerInfo, ToolCallRequest, ToolCallResult, ToolRegistry,
    ToolsCapability,
};

/// Name, version and protocol version reported by `initialize` and the
/// health probe.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

/// Result of one method plus whatever the tool reported about its model call.
struct Outcome {
    result: Result<Value, JsonRpcError>,
    model_input: Option<String>,
    model_output: Option<String>,
}

impl Outcome {
    fn ok(result: Value) -> Self {
        Self {
            result: Ok(result),
            model_input: None,
            model_output: None,
        }
    }

    fn err(code: i32, message: impl Into<String>) -> Self {
        Self {
            result: Err(JsonRpcError::new(code, message)),
            model_input: None,
            model_output: None,
        }
    }
}

pub struct Dispatcher {
    identity: ServerIdentity,
    registry: ToolRegistry,
    state: Arc<StateStore>,
}

impl Dispatcher {
    pub fn new(identity: ServerIdentity, registry: ToolRegistry, state: Arc<StateStore>) -> Self {
        Self {
            identity,
            registry,
            state,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Route one request and build its response envelope.
    pub fn dispatch(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let request_id = request.id_string();
        let span = hb_telemetry::tracing_setup::dispatch_span(&request.method, request_id.as_deref());
        let _guard = span.enter();
        info!("request received");

        let tool_call = (request.method == "tools/call")
            .then(|| ToolCallRequest::from_params(request.params.as_ref()));

        let mut entry = RequestLogEntry::new(&request.method).with_request_id(request_id);
        if let Some(Ok(call)) = &tool_call {
            entry = entry.with_tool(call.name.clone(), call.arguments.clone());
        }
        let log_id = self.state.append_request_log(entry);
        let started = Instant::now();

        // `tool_call` is Some exactly when the method is tools/call.
        let outcome = match (request.method.as_str(), tool_call) {
            (_, Some(Ok(call))) => self.call_tool(&call),
            (_, Some(Err(message))) => {
                Outcome::err(error_codes::INVALID_PARAMS, format!("Invalid params: {message}"))
            }
            ("initialize", None) => self.initialize(),
            ("tools/list", None) => self.list_tools(),
            (other, None) => Outcome::err(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut update = RequestLogUpdate {
            model_input: outcome.model_input,
            model_output: outcome.model_output,
            duration_ms: Some(duration_ms),
            ..Default::default()
        };

        let response = match outcome.result {
            Ok(result) => {
                update.response = Some(result.clone());
                JsonRpcResponse::success(request.id.clone(), result)
            }
            Err(error) => {
                warn!(code = error.code, message = %error.message, "request failed");
                update.error = Some(error.message.clone());
                JsonRpcResponse::from_error(request.id.clone(), error)
            }
        };
        self.state.update_request_log(log_id, update);
        info!(duration_ms, "response ready");
        response
    }

    fn initialize(&self) -> Outcome {
        let result = InitializeResult {
            protocol_version: self.identity.protocol_version.clone(),
            server_info: ServerInfo {
                name: self.identity.name.clone(),
                version: self.identity.version.clone(),
            },
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
            },
        };
        to_outcome(&result)
    }

    fn list_tools(&self) -> Outcome {
        Outcome::ok(json!({ "tools": self.registry.descriptors() }))
    }

    fn call_tool(&self, call: &ToolCallRequest) -> Outcome {
        let Some(handler) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, "unknown tool requested");
            return to_outcome(&ToolCallResult::unknown_tool(&call.name));
        };

        info!(tool = %call.name, "invoking tool");
        match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&call.arguments))) {
            Ok(Ok(output)) => {
                let mut outcome = to_outcome(&ToolCallResult::text(output.text));
                outcome.model_input = output.model_input;
                outcome.model_output = output.model_output;
                outcome
            }
            Ok(Err(e)) => Outcome::err(error_codes::INTERNAL_ERROR, e.to_string()),
            Err(payload) => Outcome::err(error_codes::INTERNAL_ERROR, panic_message(payload.as_ref())),
        }
    }
}

fn to_outcome<T: serde::Serialize>(value: &T) -> Outcome {
    match serde_json::to_value(value) {
        Ok(v) => Outcome::ok(v),
        Err(e) => Outcome::err(error_codes::INTERNAL_ERROR, format!("failed to serialize result: {e}")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("tool panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("tool panicked: {s}")
    } else {
        "tool panicked".to_string()
    }
}
