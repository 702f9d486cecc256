//! Blocking client for an OpenAI-compatible local chat-completions endpoint.
//!
//! Tools run on blocking worker threads, so the client here is the
//! `reqwest::blocking` flavour. Construct it outside any async context.
//!
//! Besides the transport, this module owns the post-processing every tool
//! applies to model output: [`extract_content`] pulls the assistant text out
//! of a completion body and [`parse_json_response`] turns it into JSON,
//! tolerating Markdown code fences.

use std::sync::LazyLock;
use std::time::Duration;

use hb_core::config::ModelConfig;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Number of characters of unparseable model output kept in the fallback.
pub const RAW_TEXT_LIMIT: usize = 500;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("code fence regex"));

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ModelError {
    /// Connection refused, DNS, TLS and similar transport failures.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    /// The endpoint answered but the body was not a usable completion.
    #[error("parse error: {0}")]
    Parse(String),
}

impl ModelError {
    /// True for failures where the model never produced a usable answer
    /// because it could not be reached or refused the request.
    pub fn is_connection_failure(&self) -> bool {
        !matches!(self, ModelError::Parse(_))
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::Timeout
        } else {
            ModelError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// One single-turn chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_content: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn from_config(config: &ModelConfig, system_prompt: impl Into<String>, user_content: impl Into<String>) -> Self {
        Self {
            model: config.model_id.clone(),
            system_prompt: system_prompt.into(),
            user_content: user_content.into(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    fn to_body(&self) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": self.user_content },
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

/// Something that can answer a [`ChatRequest`] with the assistant's text.
pub trait ChatBackend: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> Result<String, ModelError>;
}

// ---------------------------------------------------------------------------
// LocalModelClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LocalModelClient {
    client: reqwest::blocking::Client,
    chat_url: String,
}

impl LocalModelClient {
    pub fn new(chat_url: impl Into<String>, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            chat_url: chat_url.into(),
        })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        Self::new(config.chat_url(), config.timeout())
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }
}

impl ChatBackend for LocalModelClient {
    fn complete(&self, request: &ChatRequest) -> Result<String, ModelError> {
        debug!(url = %self.chat_url, model = %request.model, "sending chat completion");

        let resp = self
            .client
            .post(&self.chat_url)
            .header("Content-Type", "application/json")
            .json(&request.to_body())
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = resp.json().map_err(|e| ModelError::Parse(e.to_string()))?;
        extract_content(&body)
    }
}

// ---------------------------------------------------------------------------
// Output handling
// ---------------------------------------------------------------------------

/// Pull `choices[0].message.content` out of a completion body.
///
/// Content may be a plain string or a list of parts; text parts are
/// concatenated in order and anything else is skipped.
pub fn extract_content(body: &Value) -> Result<String, ModelError> {
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .ok_or_else(|| ModelError::Parse("no message content in completion".into()))?;

    match content {
        Value::String(s) => Ok(s.clone()),
        Value::Array(parts) => Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect()),
        Value::Null => Ok(String::new()),
        other => Err(ModelError::Parse(format!("unexpected content type: {other}"))),
    }
}

/// Return the body of the first fenced block, or the trimmed text when
/// there is none.
pub fn strip_code_fences(text: &str) -> &str {
    match CODE_FENCE.captures(text).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim(),
        None => text.trim(),
    }
}

/// Parse model output as JSON. Output that is not JSON becomes an error
/// object carrying the first [`RAW_TEXT_LIMIT`] characters of the cleaned
/// text.
pub fn parse_json_response(text: &str) -> Value {
    let cleaned = strip_code_fences(text);
    match serde_json::from_str(cleaned) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "model output is not JSON");
            json!({
                "error": "JSON parse failed",
                "raw_text": cleaned.chars().take(RAW_TEXT_LIMIT).collect::<String>(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let text = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(text), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fence_with_preamble() {
        let text = "Here you go:\n```\n{\"a\": 1}\n```\nthanks";
        assert_eq!(strip_code_fences(text), "{\"a\": 1}");
    }

    #[test]
    fn unfenced_text_is_trimmed() {
        assert_eq!(strip_code_fences("  {\"a\": 1}\n"), "{\"a\": 1}");
    }

    #[test]
    fn parse_fenced_json() {
        let value = parse_json_response("```json\n{\"recommendations\": [\"rest\"]}\n```");
        assert_eq!(value["recommendations"][0], "rest");
    }

    #[test]
    fn parse_failure_keeps_truncated_raw_text() {
        let text = "x".repeat(800);
        let value = parse_json_response(&text);
        assert_eq!(value["error"], "JSON parse failed");
        assert_eq!(value["raw_text"].as_str().unwrap().len(), RAW_TEXT_LIMIT);
    }

    #[test]
    fn truncation_counts_characters() {
        let text = "症".repeat(600);
        let value = parse_json_response(&text);
        assert_eq!(value["raw_text"].as_str().unwrap().chars().count(), RAW_TEXT_LIMIT);
    }

    #[test]
    fn extract_string_content() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "hello"}}]});
        assert_eq!(extract_content(&body).unwrap(), "hello");
    }

    #[test]
    fn extract_part_list_content() {
        let body = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "{\"a\":"},
            {"type": "image_url", "image_url": {"url": "x"}},
            {"type": "text", "text": "1}"}
        ]}}]});
        assert_eq!(extract_content(&body).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn extract_missing_choices_is_parse_error() {
        let err = extract_content(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, ModelError::Parse(_)));
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn request_body_shape() {
        let config = ModelConfig::default();
        let body = ChatRequest::from_config(&config, "sys", "user").to_body();
        assert_eq!(body["model"], config.model_id);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "user");
        assert_eq!(body["max_tokens"], 2048);
    }

    #[test]
    fn timeout_counts_as_connection_failure() {
        assert!(ModelError::Timeout.is_connection_failure());
        assert!(ModelError::Api { status: 500, message: String::new() }.is_connection_failure());
    }
}
