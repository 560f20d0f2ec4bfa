use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Text completion seam. The workflow only ever needs prompt in, text out.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Providers reachable through an OpenAI-compatible chat completions API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    OpenRouter,
    Groq,
    Google,
    Ollama,
    Custom,
}

impl LlmProvider {
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            LlmProvider::OpenAi => Some("https://api.openai.com/v1"),
            LlmProvider::OpenRouter => Some("https://openrouter.ai/api/v1"),
            LlmProvider::Groq => Some("https://api.groq.com/openai/v1"),
            LlmProvider::Google => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            LlmProvider::Ollama => Some("http://localhost:11434/v1"),
            LlmProvider::Custom => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, LlmProvider::Ollama)
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::OpenRouter => "openrouter",
            LlmProvider::Groq => "groq",
            LlmProvider::Google => "google",
            LlmProvider::Ollama => "ollama",
            LlmProvider::Custom => "custom",
        };
        f.write_str(name)
    }
}

impl FromStr for LlmProvider {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "openrouter" => Ok(LlmProvider::OpenRouter),
            "groq" => Ok(LlmProvider::Groq),
            "google" | "gemini" => Ok(LlmProvider::Google),
            "ollama" => Ok(LlmProvider::Ollama),
            "custom" => Ok(LlmProvider::Custom),
            other => Err(AgentError::Config(format!("Unknown LLM provider '{}'", other))),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub temperature: f32,
}

// Keeps the credential out of logs.
impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: ModelConfig,
    system_prompt: Option<String>,
}

impl LlmClient {
    pub fn new(config: ModelConfig, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            system_prompt: None,
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ref system) = self.system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
        });

        // Reasoning models reject a temperature and spend tokens on reasoning
        let model = self.config.model.as_str();
        if model.starts_with("gpt-5") || model.starts_with("o1") || model.starts_with("o3") {
            body["max_completion_tokens"] = serde_json::json!(4000);
        } else {
            body["temperature"] = serde_json::json!(self.config.temperature);
            body["max_tokens"] = serde_json::json!(1000);
        }
        body
    }

    async fn call_llm(&self, prompt: &str) -> Result<String> {
        debug!(model = %self.config.model, prompt_chars = prompt.len(), "Calling LLM");

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt));
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AgentError::Llm("LLM API rate limit reached".to_string()));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        extract_content(&response_json)
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.call_llm(prompt).await
    }
}

/// Pull the assistant text out of a chat completions response body.
pub fn extract_content(response_json: &serde_json::Value) -> Result<String> {
    if let Some(error) = response_json.get("error") {
        return Err(AgentError::Llm(format!("LLM API error: {}", error)));
    }

    let choices = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| AgentError::Llm("No choices array in LLM response".to_string()))?;
    let first = choices
        .first()
        .ok_or_else(|| AgentError::Llm("Empty choices array in LLM response".to_string()))?;

    match first.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("LLM response was truncated due to length limit"),
        Some("content_filter") => {
            return Err(AgentError::Llm("LLM response was filtered by content policy".to_string()))
        }
        _ => {}
    }

    let content = first["message"]["content"]
        .as_str()
        .ok_or_else(|| AgentError::Llm("No content in LLM response".to_string()))?;
    if content.trim().is_empty() {
        return Err(AgentError::Llm("Empty content in LLM response".to_string()));
    }
    Ok(content.to_string())
}
