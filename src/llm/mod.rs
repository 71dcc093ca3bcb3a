//! LLM executor (spec §4.E): runs one extraction attempt against one
//! (provider, model), building the HTTP request per the registry's API
//! config and parsing the response per api-format.
//!
//! Grounded on the teacher's download-client pattern (a single `reqwest`
//! client shared across calls, explicit per-call timeout), generalized from
//! "download a resource" to "call a chat-completions endpoint".

mod request;

pub use request::{build_request_body, extract_assistant_text};

use std::time::Duration;

use thiserror::Error;

use crate::registry::{ApiConfig, AuthType, ResponseFormat};

#[derive(Debug, Error)]
pub enum LlmExecutorError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("response did not parse as structured JSON: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub prompt: String,
    pub schema: serde_json::Value,
    pub temperature: f32,
    pub max_tokens: u32,
    pub strict_mode: bool,
    pub supports_structured_output: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub data: serde_json::Value,
    pub token_in: u64,
    pub token_out: u64,
    pub generation_id: Option<String>,
}

pub struct LlmExecutor {
    http: reqwest::Client,
}

impl Default for LlmExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmExecutor {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Run one attempt. Returns `Err(LlmExecutorError::HttpStatus{..})` on a
    /// non-2xx response so the caller (chain runner) can classify it via
    /// [`crate::classifier::classify`]; transport and JSON-shape errors are
    /// surfaced the same way.
    pub async fn execute(
        &self,
        api_config: &ApiConfig,
        api_key: &str,
        model: &str,
        request: &ExtractRequest,
    ) -> Result<ExtractOutcome, LlmExecutorError> {
        let url = format!("{}{}", api_config.base_url, api_config.chat_endpoint);
        let body = build_request_body(api_config.response_format, model, request);

        let mut builder = self.http.post(&url).timeout(request.timeout).json(&body);
        builder = match api_config.auth_type {
            AuthType::Bearer => builder.bearer_auth(api_key),
            AuthType::HeaderKeyed => {
                let header = api_config.custom_auth_header.as_deref().unwrap_or("x-api-key");
                builder.header(header, api_key)
            }
            AuthType::None => builder,
        };
        for (key, value) in &api_config.extra_headers {
            builder = builder.header(key, value);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmExecutorError::HttpStatus { status: status.as_u16(), body: body_text });
        }

        let raw: serde_json::Value = response.json().await?;
        let (text, token_in, token_out) = extract_assistant_text(api_config.response_format, &raw);

        let data: serde_json::Value = serde_json::from_str(&text).map_err(|e| LlmExecutorError::InvalidJson(e.to_string()))?;
        if !data.is_object() {
            return Err(LlmExecutorError::InvalidJson("structured response was not a JSON object".to_string()));
        }

        let generation_id = raw.get("id").and_then(|v| v.as_str()).map(String::from);

        Ok(ExtractOutcome { data, token_in, token_out, generation_id })
    }
}
