//! LLM Adapter
//!
//! One chat-completion interface over two providers (Anthropic messages,
//! OpenAI chat completions) with logical-model routing and an optional
//! single-shot fallback to OpenAI when the primary provider errors.

use crate::config::{Config, LlmProviderKind};
use crate::error::{AppError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Logical model name; resolved per provider via the routing table.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub provider: &'static str,
}

/// Maps a logical model name to provider-specific identifiers.
struct ModelRoute {
    logical: &'static str,
    anthropic: &'static str,
    openai: &'static str,
}

const MODEL_ROUTES: &[ModelRoute] = &[
    ModelRoute {
        logical: "claude-sonnet",
        anthropic: "claude-sonnet-4-5-20250929",
        openai: "gpt-4o",
    },
    ModelRoute {
        logical: "claude-haiku",
        anthropic: "claude-3-5-haiku-20241022",
        openai: "gpt-4o-mini",
    },
    ModelRoute {
        logical: "gpt-4o",
        anthropic: "claude-sonnet-4-5-20250929",
        openai: "gpt-4o",
    },
    ModelRoute {
        logical: "gpt-4o-mini",
        anthropic: "claude-3-5-haiku-20241022",
        openai: "gpt-4o-mini",
    },
    ModelRoute {
        logical: "o4-mini",
        anthropic: "claude-sonnet-4-5-20250929",
        openai: "o4-mini",
    },
];

fn resolve_model(logical: &str, provider: LlmProviderKind) -> String {
    for route in MODEL_ROUTES {
        if route.logical == logical {
            return match provider {
                LlmProviderKind::Anthropic => route.anthropic.to_string(),
                LlmProviderKind::OpenAi => route.openai.to_string(),
            };
        }
    }
    // Unrecognized names pass through untouched so new models work without
    // a code change.
    logical.to_string()
}

/// Reasoning-class OpenAI models reject any non-default temperature; the
/// parameter must be omitted entirely for them.
fn requires_default_temperature(model_id: &str) -> bool {
    ["o1", "o3", "o4", "gpt-5"]
        .iter()
        .any(|prefix| model_id == *prefix || model_id.starts_with(&format!("{}-", prefix)))
}

/// LLMs wrap JSON in markdown fences unpredictably. Prefer the contents of
/// the first triple-backtick block (with an optional `json` tag); fall back
/// to the raw body.
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        let after = after.trim_start();
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
        return after.trim();
    }
    trimmed
}

/// Decode a completion body into `T`, tolerating code fences.
pub fn parse_response<T: DeserializeOwned>(content: &str) -> Result<T> {
    let json = extract_json(content);
    serde_json::from_str(json).map_err(|e| {
        AppError::Parse(format!("LLM response did not decode: {} | body was: {}", e, json))
    })
}

pub struct LlmAdapter {
    client: reqwest::Client,
    primary: LlmProviderKind,
    anthropic_api_key: Option<String>,
    openai_api_key: Option<String>,
    fallback_to_openai: bool,
    pub default_model: String,
}

impl LlmAdapter {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            primary: config.llm_provider,
            anthropic_api_key: config.anthropic_api_key.clone(),
            openai_api_key: config.openai_api_key.clone(),
            fallback_to_openai: config.llm_fallback_to_openai,
            default_model: config.default_llm_model.clone(),
        }
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        match self.call_provider(self.primary, request).await {
            Ok(completion) => Ok(completion),
            Err(e) => {
                let can_fall_back = self.fallback_to_openai
                    && self.primary != LlmProviderKind::OpenAi
                    && self.openai_api_key.is_some();
                if !can_fall_back {
                    return Err(e);
                }
                warn!(
                    "Primary LLM provider failed ({}), falling back to OpenAI for model {}",
                    e, request.model
                );
                self.call_provider(LlmProviderKind::OpenAi, request).await
            }
        }
    }

    async fn call_provider(
        &self,
        provider: LlmProviderKind,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let model_id = resolve_model(&request.model, provider);
        debug!("LLM call: {:?} model {}", provider, model_id);
        match provider {
            LlmProviderKind::Anthropic => self.call_anthropic(&model_id, request).await,
            LlmProviderKind::OpenAi => self.call_openai(&model_id, request).await,
        }
    }

    async fn call_anthropic(
        &self,
        model_id: &str,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let api_key = self.anthropic_api_key.as_ref().ok_or_else(|| {
            AppError::Unavailable("ANTHROPIC_API_KEY not configured".to_string())
        })?;

        // Anthropic takes the system prompt as a top-level field.
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<&ChatMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();

        let mut body = serde_json::json!({
            "model": model_id,
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system.join("\n\n"));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpStatus { service: "anthropic", status, body });
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("unreadable Anthropic response: {}", e)))?;

        let content = parsed
            .content
            .iter()
            .find_map(|block| block.text.clone())
            .ok_or_else(|| AppError::Parse("no content in Anthropic response".to_string()))?;

        let usage = Usage {
            prompt_tokens: parsed.usage.input_tokens,
            completion_tokens: parsed.usage.output_tokens,
            total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
        };

        Ok(Completion {
            content,
            model: parsed.model,
            usage,
            provider: "anthropic",
        })
    }

    async fn call_openai(&self, model_id: &str, request: &CompletionRequest) -> Result<Completion> {
        let api_key = self
            .openai_api_key
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("OPENAI_API_KEY not configured".to_string()))?;

        let mut body = serde_json::json!({
            "model": model_id,
            "messages": request.messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            if !requires_default_temperature(model_id) {
                body["temperature"] = serde_json::json!(temperature);
            }
        }

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpStatus { service: "openai", status, body });
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("unreadable OpenAI response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Parse("no content in OpenAI response".to_string()))?;

        Ok(Completion {
            content,
            model: parsed.model,
            usage: parsed.usage.unwrap_or_default(),
            provider: "openai",
        })
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    model: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    model: String,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_passes_plain_bodies_through() {
        assert_eq!(extract_json(r#"{"a": 1}"#), r#"{"a": 1}"#);
        assert_eq!(extract_json("  {\"a\": 1}  "), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_strips_tagged_fences() {
        let body = "```json\n{\"clips\": []}\n```";
        assert_eq!(extract_json(body), r#"{"clips": []}"#);
    }

    #[test]
    fn extract_json_strips_untagged_fences_with_prose() {
        let body = "Here you go:\n```\n{\"clips\": []}\n```\nLet me know!";
        assert_eq!(extract_json(body), r#"{"clips": []}"#);
    }

    #[test]
    fn extract_json_tolerates_unterminated_fence() {
        let body = "```json\n{\"clips\": []}";
        assert_eq!(extract_json(body), r#"{"clips": []}"#);
    }

    #[test]
    fn parse_response_decodes_fenced_payload() {
        #[derive(Deserialize)]
        struct Payload {
            clips: Vec<u32>,
        }
        let payload: Payload = parse_response("```json\n{\"clips\": [1, 2]}\n```").unwrap();
        assert_eq!(payload.clips, vec![1, 2]);
    }

    #[test]
    fn routing_resolves_per_provider() {
        assert_eq!(
            resolve_model("claude-sonnet", LlmProviderKind::Anthropic),
            "claude-sonnet-4-5-20250929"
        );
        assert_eq!(resolve_model("claude-sonnet", LlmProviderKind::OpenAi), "gpt-4o");
        // Unknown names pass through.
        assert_eq!(
            resolve_model("some-future-model", LlmProviderKind::OpenAi),
            "some-future-model"
        );
    }

    #[test]
    fn reasoning_models_reject_temperature() {
        assert!(requires_default_temperature("o1"));
        assert!(requires_default_temperature("o3-mini"));
        assert!(requires_default_temperature("gpt-5-mini"));
        assert!(!requires_default_temperature("gpt-4o"));
        assert!(!requires_default_temperature("gpt-4o-mini"));
    }
}
