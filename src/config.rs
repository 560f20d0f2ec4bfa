//! Environment configuration
//!
//! Every option is read once at process start. `from_env` is what the
//! binary uses; `from_lookup` takes any key lookup so tests never touch the
//! process environment. Model credentials are only checked by
//! `require_model`, so commands that never call the model run without them.

use crate::error::{AgentError, Result};
use crate::llm::{LlmProvider, ModelConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub few_shot_database_url: Option<String>,
    pub model: ModelConfig,
    pub recent_messages_kept: usize,
    pub older_messages_char_threshold: usize,
    pub max_generation_attempts: u32,
    pub max_execution_attempts: u32,
    pub max_cross_joins: usize,
    pub llm_timeout: Duration,
    pub query_timeout: Duration,
    pub run_deadline: Duration,
    pub retry_backoff: Duration,
    pub max_result_rows: usize,
    pub display_rows: usize,
    pub schema_sample_rows: usize,
    pub few_shot_examples: usize,
    pub execution_log_file: Option<PathBuf>,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("FEYOD_DATABASE_URL")
            .ok_or_else(|| AgentError::Config("FEYOD_DATABASE_URL is not set".to_string()))?;

        let provider: LlmProvider = get("LLM_PROVIDER")
            .unwrap_or_else(|| "openai".to_string())
            .parse()?;
        let base_url = get("LLM_BASE_URL")
            .or_else(|| provider.default_base_url().map(str::to_string))
            .unwrap_or_default();

        let model = ModelConfig {
            provider,
            model: get("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key: get("LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")).unwrap_or_default(),
            base_url,
            temperature: parse_or(&get, "LLM_TEMPERATURE", 0.0_f32)?,
        };

        let max_generation_attempts: u32 = parse_or(&get, "MAX_GENERATION_ATTEMPTS", 3)?;
        let max_execution_attempts: u32 = parse_or(&get, "MAX_EXECUTION_ATTEMPTS", 2)?;
        if max_generation_attempts == 0 || max_execution_attempts == 0 {
            return Err(AgentError::Config(
                "attempt budgets must be at least 1".to_string(),
            ));
        }
        let max_result_rows: usize = parse_or(&get, "MAX_RESULT_ROWS", 500)?;
        if max_result_rows == 0 {
            return Err(AgentError::Config("MAX_RESULT_ROWS must be at least 1".to_string()));
        }

        Ok(Self {
            database_url,
            few_shot_database_url: get("FEW_SHOT_DATABASE_URL"),
            model,
            recent_messages_kept: parse_or(&get, "RECENT_MESSAGES_KEPT", 25)?,
            older_messages_char_threshold: parse_or(&get, "OLDER_MESSAGES_CHAR_THRESHOLD", 3000)?,
            max_generation_attempts,
            max_execution_attempts,
            max_cross_joins: parse_or(&get, "MAX_CROSS_JOINS", 1)?,
            llm_timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 30)?),
            query_timeout: Duration::from_secs(parse_or(&get, "QUERY_TIMEOUT_SECS", 15)?),
            run_deadline: Duration::from_secs(parse_or(&get, "RUN_DEADLINE_SECS", 120)?),
            retry_backoff: Duration::from_millis(parse_or(&get, "RETRY_BACKOFF_MS", 250)?),
            max_result_rows,
            display_rows: parse_or(&get, "DISPLAY_ROWS", 25)?,
            schema_sample_rows: parse_or(&get, "SCHEMA_SAMPLE_ROWS", 3)?,
            few_shot_examples: parse_or(&get, "FEW_SHOT_EXAMPLES", 3)?,
            execution_log_file: get("EXECUTION_LOG_FILE").map(PathBuf::from),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()).to_lowercase(),
        })
    }
}

impl AppConfig {
    /// The model settings, once they are complete enough to make calls.
    pub fn require_model(&self) -> Result<&ModelConfig> {
        let provider = self.model.provider;
        if self.model.api_key.is_empty() && provider.requires_api_key() {
            return Err(AgentError::Config(format!(
                "LLM_API_KEY is required for provider '{}'",
                provider
            )));
        }
        if self.model.base_url.is_empty() {
            return Err(AgentError::Config(format!(
                "LLM_BASE_URL is required for provider '{}'",
                provider
            )));
        }
        Ok(&self.model)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| AgentError::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("FEYOD_DATABASE_URL", "sqlite://feyod.db"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();

        assert_eq!(config.recent_messages_kept, 25);
        assert_eq!(config.older_messages_char_threshold, 3000);
        assert_eq!(config.max_generation_attempts, 3);
        assert_eq!(config.max_execution_attempts, 2);
        let model = config.require_model().unwrap();
        assert_eq!(model.api_key, "sk-test");
        assert_eq!(model.base_url, "https://api.openai.com/v1");
        assert!(config.few_shot_database_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("FEYOD_DATABASE_URL", "sqlite://feyod.db"),
            ("LLM_PROVIDER", "ollama"),
            ("LLM_MODEL", "llama3"),
            ("RECENT_MESSAGES_KEPT", "4"),
            ("OLDER_MESSAGES_CHAR_THRESHOLD", "120"),
            ("LOG_LEVEL", "DEBUG"),
        ]))
        .unwrap();

        assert_eq!(config.model.provider, LlmProvider::Ollama);
        assert_eq!(config.model.model, "llama3");
        assert_eq!(config.recent_messages_kept, 4);
        assert_eq!(config.older_messages_char_threshold, 120);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_database_url() {
        let err = AppConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("FEYOD_DATABASE_URL", "sqlite://feyod.db"),
            ("OPENAI_API_KEY", "sk-test"),
            ("MAX_GENERATION_ATTEMPTS", "three"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("MAX_GENERATION_ATTEMPTS"));
    }

    #[test]
    fn test_zero_budget_is_rejected() {
        let result = AppConfig::from_lookup(lookup(&[
            ("FEYOD_DATABASE_URL", "sqlite://feyod.db"),
            ("OPENAI_API_KEY", "sk-test"),
            ("MAX_EXECUTION_ATTEMPTS", "0"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_row_cap_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("FEYOD_DATABASE_URL", "sqlite://feyod.db"),
            ("MAX_RESULT_ROWS", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("MAX_RESULT_ROWS"));
    }

    #[test]
    fn test_custom_provider_needs_base_url() {
        let config = AppConfig::from_lookup(lookup(&[
            ("FEYOD_DATABASE_URL", "sqlite://feyod.db"),
            ("LLM_PROVIDER", "custom"),
            ("LLM_API_KEY", "key"),
        ]))
        .unwrap();
        let err = config.require_model().unwrap_err();
        assert!(err.to_string().contains("LLM_BASE_URL"));
    }

    #[test]
    fn test_missing_api_key_only_blocks_model_use() {
        let config = AppConfig::from_lookup(lookup(&[("FEYOD_DATABASE_URL", "sqlite://feyod.db")])).unwrap();
        assert_eq!(config.database_url, "sqlite://feyod.db");
        let err = config.require_model().unwrap_err();
        assert!(err.to_string().contains("LLM_API_KEY"));
    }
}
