use anyhow::{bail, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ProviderError;
use crate::record::{FileType, Newness};
use common::LlmConfig;

pub mod backend;
pub mod gemini;
pub mod openai;
pub mod prompts;

pub use backend::PromptBackend;

/// Transport to a hosted or local model (one HTTP dialect per implementation)
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Generate a completion for a single prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError>;
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON-only answer where it supports that
    pub json: bool,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Input to one classification call. `content` is already truncated.
#[derive(Debug, Clone)]
pub struct ClassifyRequest {
    pub url: String,
    pub filetype: FileType,
    pub content: String,
    pub run_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub is_new: Newness,
    pub category: String,
    pub summary: String,
    /// The backend's own opinion; only used when the content carries no date.
    pub is_stale: bool,
}

/// A briefing item offered to the ranking pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryCandidate {
    pub url: String,
    pub category: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub url: String,
    pub title: String,
    pub date: Option<NaiveDate>,
    pub time: Option<String>,
    pub location: Option<String>,
    pub summary: String,
}

/// Model backend as seen by the pipeline: one call per operation, no retries.
#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ProviderError>;

    /// Return up to `top_n` urls, most important first.
    async fn rank(
        &self,
        stories: &[StoryCandidate],
        meetings: &[Meeting],
        top_n: usize,
    ) -> Result<Vec<String>, ProviderError>;
}

#[async_trait::async_trait]
pub trait MeetingParser: Send + Sync {
    async fn parse(
        &self,
        url: &str,
        raw_text: &str,
        run_date: NaiveDate,
    ) -> Result<Meeting, ProviderError>;
}

/// Supported backend variants, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    OpenRouter,
    LmStudio,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "lmstudio" | "lm_studio" | "local" => Ok(ProviderKind::LmStudio),
            other => bail!("Unsupported LLM provider: {}", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::LmStudio => "lmstudio",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
            ProviderKind::LmStudio => "http://localhost:1234/v1/chat/completions",
        }
    }
}

/// Build the transport named by `llm.provider`.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    let kind = ProviderKind::parse(&config.provider())?;
    let endpoint = config
        .endpoint(kind.as_str())
        .unwrap_or_else(|| kind.default_endpoint().to_string());
    let api_key = config.api_key(kind.as_str());
    let timeout = config.timeout_seconds();

    let provider: Arc<dyn LlmProvider> = match kind {
        ProviderKind::Gemini => {
            let Some(key) = api_key else {
                bail!("No API key for gemini: set GEMINI_API_KEY or [llm.api_keys] gemini");
            };
            Arc::new(gemini::GeminiProvider::new(endpoint, key).with_timeout(timeout))
        }
        ProviderKind::OpenRouter => {
            let Some(key) = api_key else {
                bail!("No API key for openrouter: set OPENROUTER_API_KEY or [llm.api_keys] openrouter");
            };
            Arc::new(
                openai::OpenAiCompatibleProvider::new("openrouter", endpoint, Some(key))
                    .with_timeout(timeout),
            )
        }
        // Local servers accept any key.
        ProviderKind::LmStudio => Arc::new(
            openai::OpenAiCompatibleProvider::new("lmstudio", endpoint, api_key)
                .with_timeout(timeout),
        ),
    };
    Ok(provider)
}

/// Build the prompt-driven backend over the configured transport.
pub fn create_backend(config: &LlmConfig) -> Result<Arc<PromptBackend>> {
    let provider = create_provider(config)?;
    let flash = config
        .flash_model
        .clone()
        .unwrap_or_else(|| "gemini-2.0-flash".to_string());
    let pro = config
        .pro_model
        .clone()
        .unwrap_or_else(|| "gemini-2.5-pro".to_string());
    Ok(Arc::new(
        PromptBackend::new(provider, flash, pro).with_temperature(config.temperature.unwrap_or(0.2)),
    ))
}

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 3. Try the outermost object or array, whichever opens first
    [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| match (text.find(open), text.rfind(close)) {
            (Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        })
        .min_by_key(|(start, _)| *start)
        .map(|(start, end)| text[start..=end].to_string())
}
