use std::sync::{Arc, Mutex};

use hb_core::config::ModelConfig;
use hb_core::state::StateStore;
use hb_daemon::data::{MEDICAL_FILE, NO_DATA, PII_FILE};
use hb_daemon::patient_tool::{PatientBackgroundTool, TOOL_NAME};
use hb_harness::dispatcher::{Dispatcher, ServerIdentity};
use hb_harness::mcp::{JsonRpcRequest, ToolHandler, ToolRegistry};
use hb_harness::provider::{ChatBackend, ChatRequest, ModelError};
use serde_json::{json, Map, Value};

/// Backend returning a canned answer and remembering what it was asked.
struct FakeModel {
    reply: Result<String, fn() -> ModelError>,
    seen: Mutex<Vec<ChatRequest>>,
}

impl FakeModel {
    fn answering(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(err: fn() -> ModelError) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(err),
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl ChatBackend for FakeModel {
    fn complete(&self, request: &ChatRequest) -> Result<String, ModelError> {
        self.seen.lock().unwrap().push(request.clone());
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(make) => Err(make()),
        }
    }
}

fn args(symptoms: &str) -> Map<String, Value> {
    json!({ "symptoms": symptoms }).as_object().cloned().unwrap()
}

fn data_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(PII_FILE),
        json!({"patient": {"full_name": "Hanako Yamada", "age": 34}}).to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join(MEDICAL_FILE),
        json!({"allergies": ["penicillin"], "current_medications": []}).to_string(),
    )
    .unwrap();
    dir
}

#[test]
fn descriptor_requires_symptoms() {
    let tool = PatientBackgroundTool::new("unused", ModelConfig::default(), FakeModel::answering("{}"));
    let descriptor = tool.descriptor();
    assert_eq!(descriptor.name, TOOL_NAME);
    assert_eq!(descriptor.input_schema["required"], json!(["symptoms"]));
    assert_eq!(descriptor.input_schema["properties"]["symptoms"]["type"], "string");
}

#[test]
fn builds_prompt_from_records_and_parses_fenced_answer() {
    let dir = data_dir();
    let model = FakeModel::answering("```json\n{\"recommendations\": [\"avoid penicillin\"]}\n```");
    let tool = PatientBackgroundTool::new(dir.path(), ModelConfig::default(), model.clone());

    let output = tool.call(&args("fever and cough")).unwrap();

    let summary: Value = serde_json::from_str(&output.text).unwrap();
    assert_eq!(summary["recommendations"][0], "avoid penicillin");

    let seen = model.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let request = &seen[0];
    assert_eq!(request.model, ModelConfig::default().model_id);
    assert!(request.user_content.starts_with("[Reported symptoms]\nfever and cough"));
    assert!(request.user_content.contains("allergies: penicillin"));
    assert!(request.user_content.contains("Hanako Yamada"));
    assert!(request.system_prompt.contains("JSON"));

    assert_eq!(output.model_input.as_deref(), Some(request.user_content.as_str()));
    assert!(output.model_output.unwrap().starts_with("```json"));
}

#[test]
fn non_json_answer_falls_back_to_raw_text() {
    let dir = data_dir();
    let tool = PatientBackgroundTool::new(dir.path(), ModelConfig::default(), FakeModel::answering("I cannot help"));

    let output = tool.call(&args("dizziness")).unwrap();
    let summary: Value = serde_json::from_str(&output.text).unwrap();
    assert_eq!(summary["error"], "JSON parse failed");
    assert_eq!(summary["raw_text"], "I cannot help");
}

#[test]
fn connection_failure_becomes_error_content() {
    let dir = data_dir();
    let model = FakeModel::failing(|| ModelError::Http("connection refused".into()));
    let tool = PatientBackgroundTool::new(dir.path(), ModelConfig::default(), model);

    let output = tool.call(&args("headache")).unwrap();
    let summary: Value = serde_json::from_str(&output.text).unwrap();
    let error = summary["error"].as_str().unwrap();
    assert!(error.starts_with("Local model connection failed:"), "{error}");
    assert!(output.model_input.is_some());
    assert!(output.model_output.is_none());
}

#[test]
fn missing_data_dir_uses_placeholder_context() {
    let dir = tempfile::tempdir().unwrap();
    let model = FakeModel::answering("{}");
    let tool = PatientBackgroundTool::new(dir.path().join("absent"), ModelConfig::default(), model.clone());

    tool.call(&args("rash")).unwrap();
    assert!(model.seen.lock().unwrap()[0].user_content.ends_with(NO_DATA));
}

#[test]
fn missing_symptoms_is_rejected() {
    let tool = PatientBackgroundTool::new("unused", ModelConfig::default(), FakeModel::answering("{}"));
    assert!(tool.call(&Map::new()).is_err());
    assert!(tool.call(&json!({"symptoms": 3}).as_object().cloned().unwrap()).is_err());
}

#[test]
fn dispatch_through_tools_call_logs_model_io() {
    let dir = data_dir();
    let state = Arc::new(StateStore::new(8081));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(PatientBackgroundTool::new(
        dir.path(),
        ModelConfig::default(),
        FakeModel::answering("{\"patient_context\": {\"age_group\": \"30s\"}}"),
    )));
    let dispatcher = Dispatcher::new(
        ServerIdentity {
            name: "LocalMedicalContextServer".into(),
            version: "1.0.0".into(),
            protocol_version: "2025-06-18".into(),
        },
        registry,
        state.clone(),
    );

    let response = dispatcher.dispatch(&JsonRpcRequest::new(
        json!(11),
        "tools/call",
        Some(json!({"name": TOOL_NAME, "arguments": {"symptoms": "palpitations"}})),
    ));

    let result = response.result.unwrap();
    assert_eq!(result["isError"], false);
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("30s"));

    let entry = &state.recent_logs(1)[0];
    assert_eq!(entry.tool_name.as_deref(), Some(TOOL_NAME));
    assert!(entry.model_input.as_deref().unwrap().contains("palpitations"));
    assert!(entry.model_output.as_deref().unwrap().contains("age_group"));
}
