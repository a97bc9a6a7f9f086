use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{AnalysisError, Result};

/// Which call path a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPurpose {
    FileAnalysis,
    ArchitectureSummary,
    Chat,
}

/// One system + user exchange sent to the completion endpoint
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: CompletionPurpose,
    pub model: String,
    pub system: String,
    pub user: String,
    /// Ask the provider for a single JSON object
    pub json_response: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Black-box text completion capability.
///
/// Implementations return the raw assistant text; an empty string means the
/// upstream answered without content.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> std::result::Result<String, AnalysisError>;

    /// Get the provider name (e.g., "Groq", "OpenAI")
    fn provider_name(&self) -> &str;
}

/// Factory for the configured provider
pub fn create_provider(config: &LlmConfig, timeout: Duration) -> Result<Box<dyn CompletionProvider>> {
    Ok(Box::new(ChatCompletionsProvider::new(config, timeout)?))
}

/// OpenAI-compatible `/chat/completions` client (Groq, OpenAI, proxies)
pub struct ChatCompletionsProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatCompletionsProvider {
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self> {
        let base_url = config.resolved_base_url()?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::CodepulseError::Config(format!("HTTP client: {}", e)))?;

        let name = match config.provider.as_str() {
            "groq" => "Groq",
            "openai" => "OpenAI",
            _ => "Chat completions",
        };

        Ok(Self {
            name: name.to_string(),
            base_url,
            api_key: config.resolved_api_key(),
            client,
        })
    }

    fn build_payload(request: &CompletionRequest) -> serde_json::Value {
        let mut payload = json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user }
            ]
        });

        if request.json_response {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        payload
    }
}

#[async_trait]
impl CompletionProvider for ChatCompletionsProvider {
    async fn complete(&self, request: CompletionRequest) -> std::result::Result<String, AnalysisError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            AnalysisError::Unconfigured(format!("no API key for {}", self.name))
        })?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&Self::build_payload(&request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| "upstream intelligence error".to_string());
            return Err(AnalysisError::UpstreamRejected {
                status: status.as_u16(),
                message,
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalysisError::Parse(format!("completion envelope: {}", e)))?;

        Ok(data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}
