//! Per-api-format request building and response parsing (spec §4.E).

use serde_json::json;

use crate::registry::ResponseFormat;

use super::ExtractRequest;

/// Build the provider-specific chat-completion body. When the model
/// supports structured outputs and strict mode is requested, the schema is
/// serialized into the provider's structured-output parameter; otherwise
/// it's embedded into the system prompt (spec §4.E).
pub fn build_request_body(format: ResponseFormat, model: &str, request: &ExtractRequest) -> serde_json::Value {
    let use_structured_param = request.supports_structured_output && request.strict_mode;
    let system_prompt = if use_structured_param {
        "Extract structured data from the page content per the provided schema.".to_string()
    } else {
        format!(
            "Extract structured data from the page content. Respond with JSON matching this schema:\n{}",
            request.schema
        )
    };

    match format {
        ResponseFormat::OpenAi => {
            let mut body = json!({
                "model": model,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
                "messages": [
                    {"role": "system", "content": system_prompt},
                    {"role": "user", "content": request.prompt},
                ],
            });
            if use_structured_param {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {"name": "extraction", "strict": true, "schema": request.schema},
                });
            } else {
                body["response_format"] = json!({"type": "json_object"});
            }
            body
        }
        ResponseFormat::Anthropic => {
            let mut body = json!({
                "model": model,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
                "system": system_prompt,
                "messages": [{"role": "user", "content": request.prompt}],
            });
            if use_structured_param {
                body["tools"] = json!([{
                    "name": "extraction",
                    "description": "Return the extracted data.",
                    "input_schema": request.schema,
                }]);
                body["tool_choice"] = json!({"type": "tool", "name": "extraction"});
            }
            body
        }
        ResponseFormat::Ollama => json!({
            "model": model,
            "stream": false,
            "options": {"temperature": request.temperature, "num_predict": request.max_tokens},
            "format": if use_structured_param { request.schema.clone() } else { json!("json") },
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": request.prompt},
            ],
        }),
    }
}

/// Extract assistant text plus (input, output) token counts from the raw
/// provider response, per api-format.
pub fn extract_assistant_text(format: ResponseFormat, raw: &serde_json::Value) -> (String, u64, u64) {
    match format {
        ResponseFormat::OpenAi => {
            let text = raw["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string();
            let token_in = raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
            let token_out = raw["usage"]["completion_tokens"].as_u64().unwrap_or(0);
            (text, token_in, token_out)
        }
        ResponseFormat::Anthropic => {
            let content = raw["content"].as_array().cloned().unwrap_or_default();
            let text = content
                .iter()
                .find_map(|block| block.get("input").or_else(|| block.get("text")))
                .map(|v| if v.is_string() { v.as_str().unwrap().to_string() } else { v.to_string() })
                .unwrap_or_default();
            let token_in = raw["usage"]["input_tokens"].as_u64().unwrap_or(0);
            let token_out = raw["usage"]["output_tokens"].as_u64().unwrap_or(0);
            (text, token_in, token_out)
        }
        ResponseFormat::Ollama => {
            let text = raw["message"]["content"].as_str().unwrap_or_default().to_string();
            let token_in = raw["prompt_eval_count"].as_u64().unwrap_or(0);
            let token_out = raw["eval_count"].as_u64().unwrap_or(0);
            (text, token_in, token_out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_request(supports_structured_output: bool, strict_mode: bool) -> ExtractRequest {
        ExtractRequest {
            prompt: "page content".to_string(),
            schema: json!({"type": "object", "properties": {"title": {"type": "string"}}}),
            temperature: 0.2,
            max_tokens: 4096,
            strict_mode,
            supports_structured_output,
            timeout: Duration::from_secs(120),
        }
    }

    #[test]
    fn test_openai_body_uses_json_schema_when_strict() {
        let body = build_request_body(ResponseFormat::OpenAi, "gpt-4o-mini", &sample_request(true, true));
        assert_eq!(body["response_format"]["type"], "json_schema");
    }

    #[test]
    fn test_openai_body_falls_back_to_json_object() {
        let body = build_request_body(ResponseFormat::OpenAi, "gpt-4o-mini", &sample_request(false, true));
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_anthropic_body_uses_tool_use_when_strict() {
        let body = build_request_body(ResponseFormat::Anthropic, "claude-3-5-sonnet", &sample_request(true, true));
        assert_eq!(body["tool_choice"]["type"], "tool");
    }

    #[test]
    fn test_extract_openai_response() {
        let raw = json!({
            "choices": [{"message": {"content": "{\"title\":\"Hello\"}"}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 5},
        });
        let (text, token_in, token_out) = extract_assistant_text(ResponseFormat::OpenAi, &raw);
        assert_eq!(text, "{\"title\":\"Hello\"}");
        assert_eq!(token_in, 100);
        assert_eq!(token_out, 5);
    }

    #[test]
    fn test_extract_anthropic_tool_use_response() {
        let raw = json!({
            "content": [{"type": "tool_use", "input": {"title": "Hello"}}],
            "usage": {"input_tokens": 80, "output_tokens": 12},
        });
        let (text, token_in, token_out) = extract_assistant_text(ResponseFormat::Anthropic, &raw);
        assert_eq!(text, "{\"title\":\"Hello\"}");
        assert_eq!(token_in, 80);
        assert_eq!(token_out, 12);
    }

    #[test]
    fn test_extract_ollama_response() {
        let raw = json!({
            "message": {"content": "{\"title\":\"Hi\"}"},
            "prompt_eval_count": 50,
            "eval_count": 3,
        });
        let (text, token_in, token_out) = extract_assistant_text(ResponseFormat::Ollama, &raw);
        assert_eq!(text, "{\"title\":\"Hi\"}");
        assert_eq!(token_in, 50);
        assert_eq!(token_out, 3);
    }
}
