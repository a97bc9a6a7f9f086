use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{LlmConfig, PipelineConfig};
use crate::error::{AnalysisError, Result};
use super::provider::{CompletionProvider, CompletionPurpose, CompletionRequest};
use super::super::models::truncate_bytes;

/// Explanation stored when a file could not be analyzed
pub const DEGRADED_EXPLANATION: &str = "Logic synthesis partially unavailable for this module.";

/// Architecture text stored when the summary call fails
pub const SUMMARY_UNAVAILABLE: &str = "summary unavailable";

/// Chat answer used when the upstream replies without content
pub const EMPTY_CHAT_RESPONSE: &str = "AI engine returned an empty response.";

const FILE_SYSTEM_PROMPT: &str = "Analyze source code and return a JSON object with: \
{ \"explanation\": string, \"functions\": string[], \"imports\": string[] }. ONLY return JSON. \
Provide a simple, detailed explanation in easy language that a beginner can understand.";

const SUMMARY_SYSTEM_PROMPT: &str =
    "Summarize the architecture of a GitHub repository based on its folder structure.";

/// Structured per-file result of the external analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub explanation: String,
    pub functions: Vec<String>,
    pub imports: Vec<String>,
}

impl FileAnalysis {
    /// Placeholder used when analysis is unavailable
    pub fn degraded() -> Self {
        Self {
            explanation: DEGRADED_EXPLANATION.to_string(),
            functions: Vec::new(),
            imports: Vec::new(),
        }
    }
}

/// Result of a boundary call whose failure the caller decides how to render
#[derive(Debug, Clone, PartialEq)]
pub enum Availability<T> {
    Available(T),
    Unavailable(String),
}

/// Client for the external code-understanding capability
pub struct CodeAnalyst {
    provider: Arc<dyn CompletionProvider>,
    parser: ResponseParser,
    llm: LlmConfig,
    max_content_bytes: usize,
    summary_path_limit: usize,
    call_timeout: Duration,
}

impl CodeAnalyst {
    pub fn new(provider: Arc<dyn CompletionProvider>, llm: &LlmConfig, pipeline: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            provider,
            parser: ResponseParser::new()?,
            llm: llm.clone(),
            max_content_bytes: pipeline.max_content_bytes,
            summary_path_limit: pipeline.summary_path_limit,
            call_timeout: Duration::from_secs(pipeline.call_timeout_secs),
        })
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    /// Analyze one file, reporting the typed failure
    pub async fn try_analyze_file(
        &self,
        content: &str,
        file_name: &str,
    ) -> std::result::Result<FileAnalysis, AnalysisError> {
        let request = CompletionRequest {
            purpose: CompletionPurpose::FileAnalysis,
            model: self.llm.file_model.clone(),
            system: FILE_SYSTEM_PROMPT.to_string(),
            user: format!(
                "File: {}\nCode:\n{}",
                file_name,
                truncate_bytes(content, self.max_content_bytes)
            ),
            json_response: true,
            temperature: None,
            max_tokens: self.llm.max_tokens,
        };

        let raw = self.call(request).await?;
        self.parser.parse(&raw)
    }

    /// Architecture narrative from the repository's file paths. Never empty.
    pub async fn summarize_architecture(&self, repo_name: &str, paths: &[String]) -> String {
        let capped = &paths[..paths.len().min(self.summary_path_limit)];
        let structure = serde_json::to_string(capped).unwrap_or_else(|_| "[]".to_string());

        let request = CompletionRequest {
            purpose: CompletionPurpose::ArchitectureSummary,
            model: self.llm.summary_model.clone(),
            system: SUMMARY_SYSTEM_PROMPT.to_string(),
            user: format!("Repository: {}\nStructure:\n{}", repo_name, structure),
            json_response: false,
            temperature: None,
            max_tokens: self.llm.max_tokens,
        };

        match self.call(request).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("Architecture summary for {} came back empty", repo_name);
                SUMMARY_UNAVAILABLE.to_string()
            }
            Err(e) => {
                warn!("Architecture summary for {} failed: {}", repo_name, e);
                SUMMARY_UNAVAILABLE.to_string()
            }
        }
    }

    /// Free-text answer about a repository
    pub async fn ask(&self, repo_name: &str, query: &str) -> Availability<String> {
        let request = CompletionRequest {
            purpose: CompletionPurpose::Chat,
            model: self.llm.chat_model.clone(),
            system: format!(
                "You are a Principal Software Engineer. You are helping a developer understand the codebase of \"{}\". \
                 Answer contextually based on the repository patterns and architecture.",
                repo_name
            ),
            user: query.to_string(),
            json_response: false,
            temperature: Some(self.llm.chat_temperature),
            max_tokens: self.llm.max_tokens,
        };

        match self.call(request).await {
            Ok(text) if text.trim().is_empty() => Availability::Available(EMPTY_CHAT_RESPONSE.to_string()),
            Ok(text) => Availability::Available(text),
            Err(e) => {
                warn!("Chat request for {} failed: {}", repo_name, e);
                Availability::Unavailable(e.to_string())
            }
        }
    }

    async fn call(&self, request: CompletionRequest) -> std::result::Result<String, AnalysisError> {
        debug!("{:?} call via {} ({})", request.purpose, self.provider.provider_name(), request.model);
        match tokio::time::timeout(self.call_timeout, self.provider.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::Timeout(self.call_timeout.as_secs())),
        }
    }
}

/// Turns the raw per-file completion into a [`FileAnalysis`]
pub struct ResponseParser {
    fence: Regex,
}

impl ResponseParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            fence: Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$")?,
        })
    }

    /// Parse the structured payload, tolerating a surrounding markdown fence
    pub fn parse(&self, raw: &str) -> std::result::Result<FileAnalysis, AnalysisError> {
        let body = match self.fence.captures(raw) {
            Some(caps) => caps.get(1).map_or(raw, |m| m.as_str()),
            None => raw,
        };

        let value: serde_json::Value =
            serde_json::from_str(body.trim()).map_err(|e| AnalysisError::Parse(e.to_string()))?;

        let object = value
            .as_object()
            .ok_or_else(|| AnalysisError::Parse("expected a JSON object".to_string()))?;

        let explanation = object
            .get("explanation")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AnalysisError::Parse("missing \"explanation\" string".to_string()))?
            .to_string();

        Ok(FileAnalysis {
            explanation,
            functions: string_list(object.get("functions")),
            imports: string_list(object.get("imports")),
        })
    }
}

/// Array entries as strings; non-string scalars are rendered, nulls dropped
fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    let Some(items) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect()
}
