//! `get_patient_background`: summarises local patient records against the
//! reported symptoms with the on-device model. Only the anonymised summary
//! leaves this machine.

use std::path::PathBuf;
use std::sync::Arc;

use hb_core::config::ModelConfig;
use hb_harness::mcp::{McpTool, ToolAnnotations, ToolError, ToolHandler, ToolOutput};
use hb_harness::provider::{parse_json_response, ChatBackend, ChatRequest};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::data::PatientRecords;

pub const TOOL_NAME: &str = "get_patient_background";

pub const SYSTEM_PROMPT: &str = r#"You summarise a patient's medical background locally on the user's machine.

Rules:
- Output a single JSON object and nothing else. No prose, comments or Markdown.
- Do not wrap the answer in backticks. The answer starts with { and ends with }.

Privacy:
- Never output the patient's name, address, phone number or any identifier.
- Express age as an age group (30s, 40s, ...).
- Output anonymised medical information only.

Example:
{"patient_context":{"age_group":"30s","chronic_conditions":["mild asthma"],"allergies":["penicillin"],"current_medications":["fexofenadine (antihistamine)"]},"symptom_relevance":{"related_history":["previous respiratory symptoms"],"potential_interactions":[],"risk_factors":["history of asthma"]},"recommendations":["watch respiratory symptoms","avoid penicillin antibiotics"]}

Schema:
- patient_context: age_group, chronic_conditions, allergies, current_medications
- symptom_relevance: related_history, potential_interactions, risk_factors
- recommendations: array of notes for the clinician

Compare the symptoms with the patient's background and extract only the relevant information."#;

pub struct PatientBackgroundTool {
    data_dir: PathBuf,
    model: ModelConfig,
    backend: Arc<dyn ChatBackend>,
}

impl PatientBackgroundTool {
    pub fn new(data_dir: impl Into<PathBuf>, model: ModelConfig, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            data_dir: data_dir.into(),
            model,
            backend,
        }
    }

    fn user_content(symptoms: &str, records: &PatientRecords) -> String {
        format!("[Reported symptoms]\n{symptoms}\n\n{}", records.render_context())
    }
}

impl ToolHandler for PatientBackgroundTool {
    fn descriptor(&self) -> McpTool {
        McpTool {
            name: TOOL_NAME.to_string(),
            description: "Retrieve the patient's medical background: allergies, history, current \
                          medications and relevant lab results. Records are processed locally and \
                          only an anonymised summary is returned; sensitive data never leaves \
                          this machine."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "symptoms": {
                        "type": "string",
                        "description": "Description of the symptoms reported by the user"
                    }
                },
                "required": ["symptoms"]
            }),
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(true),
                open_world_hint: Some(false),
            }),
        }
    }

    fn call(&self, arguments: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let symptoms = match arguments.get("symptoms") {
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(ToolError::InvalidArguments("symptoms must be a string".into())),
            None => return Err(ToolError::InvalidArguments("symptoms is required".into())),
        };

        let records = PatientRecords::load(&self.data_dir).map_err(|e| ToolError::Failed(e.to_string()))?;
        if records.is_empty() {
            warn!(dir = %self.data_dir.display(), "no patient records found");
        }
        let user_content = Self::user_content(symptoms, &records);
        let request = ChatRequest::from_config(&self.model, SYSTEM_PROMPT, user_content.as_str());

        info!(model = %self.model.model_id, "summarising patient background");
        debug!(input = %user_content, "model input");

        let (summary, model_output) = match self.backend.complete(&request) {
            Ok(text) => {
                debug!(output = %text, "model output");
                (parse_json_response(&text), Some(text))
            }
            Err(e) if e.is_connection_failure() => {
                warn!(error = %e, "local model unreachable");
                (json!({ "error": format!("Local model connection failed: {e}") }), None)
            }
            Err(e) => {
                warn!(error = %e, "unusable model response");
                (json!({ "error": format!("Response parsing failed: {e}") }), None)
            }
        };

        let text = serde_json::to_string_pretty(&summary).map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(ToolOutput {
            text,
            model_input: Some(user_content),
            model_output,
        })
    }
}
