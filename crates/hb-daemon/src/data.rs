//! Patient record files and their rendering into model context.
//!
//! Three JSON documents live in the data directory. Any of them may be
//! absent; a missing file reads as an empty record.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

pub const PII_FILE: &str = "patient_pii.json";
pub const MEDICAL_FILE: &str = "patient_medical.json";
pub const HISTORY_FILE: &str = "health_checkup_history.json";

pub const NO_DATA: &str = "No patient data found.";

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} must contain a JSON object")]
    NotAnObject { path: PathBuf },
}

#[derive(Debug, Clone, Default)]
pub struct PatientRecords {
    pub pii: Map<String, Value>,
    pub medical: Map<String, Value>,
    pub history: Map<String, Value>,
}

impl PatientRecords {
    pub fn load(dir: &Path) -> Result<Self, DataError> {
        Ok(Self {
            pii: load_object(&dir.join(PII_FILE))?,
            medical: load_object(&dir.join(MEDICAL_FILE))?,
            history: load_object(&dir.join(HISTORY_FILE))?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pii.is_empty() && self.medical.is_empty() && self.history.is_empty()
    }

    /// Plain-text context for the model. Identifying details are included
    /// and labelled confidential; the system prompt forbids repeating them.
    pub fn render_context(&self) -> String {
        if self.is_empty() {
            return NO_DATA.to_string();
        }

        let mut out = String::new();
        if !self.pii.is_empty() {
            section(&mut out, "Patient information (confidential)", &self.pii);
        }
        if !self.medical.is_empty() {
            section(&mut out, "Current medical information", &self.medical);
        }
        if !self.history.is_empty() {
            // The trend summary carries the useful signal; fall back to the
            // raw history when it is absent.
            let history = self
                .history
                .get("trend_summary")
                .and_then(Value::as_object)
                .unwrap_or(&self.history);
            section(&mut out, "Health checkup trends", history);
        }
        out.trim_end().to_string()
    }
}

fn load_object(path: &Path) -> Result<Map<String, Value>, DataError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(source) => {
            return Err(DataError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(DataError::NotAnObject {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(DataError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn section(out: &mut String, title: &str, fields: &Map<String, Value>) {
    let _ = writeln!(out, "[{title}]");
    for (key, value) in fields {
        render(out, key, value, 0);
    }
    out.push('\n');
}

fn render(out: &mut String, key: &str, value: &Value, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        Value::Object(map) if map.contains_key("value") => {
            let _ = writeln!(out, "{indent}{key}: {}", lab_result(map));
        }
        Value::Object(map) => {
            let _ = writeln!(out, "{indent}{key}:");
            for (k, v) in map {
                render(out, k, v, depth + 1);
            }
        }
        Value::Array(items) if items.iter().all(is_scalar) => {
            let joined: Vec<String> = items.iter().map(scalar).collect();
            let joined = if joined.is_empty() { "none".to_string() } else { joined.join(", ") };
            let _ = writeln!(out, "{indent}{key}: {joined}");
        }
        Value::Array(items) => {
            let _ = writeln!(out, "{indent}{key}:");
            for (i, item) in items.iter().enumerate() {
                render(out, &format!("- {}", i + 1), item, depth + 1);
            }
        }
        other => {
            let _ = writeln!(out, "{indent}{key}: {}", scalar(other));
        }
    }
}

/// `value unit flag` for lab entries shaped `{"value":..,"unit":..,"flag":..}`.
fn lab_result(map: &Map<String, Value>) -> String {
    let mut parts = vec![map.get("value").map(scalar).unwrap_or_default()];
    if let Some(unit) = map.get("unit").and_then(Value::as_str).filter(|u| !u.is_empty()) {
        parts.push(unit.to_string());
    }
    if let Some(flag) = map.get("flag").and_then(Value::as_str).and_then(flag_marker) {
        parts.push(flag.to_string());
    }
    parts.join(" ")
}

fn flag_marker(flag: &str) -> Option<&'static str> {
    match flag {
        "high" => Some("↑"),
        "low" => Some("↓"),
        "borderline" => Some("△"),
        _ => None,
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "unknown".to_string(),
        other => other.to_string(),
    }
}
