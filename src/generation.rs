//! Text generation clients.
//!
//! Implements the core
//! [`GenerationProvider`](journal_harness_core::generation::GenerationProvider)
//! for Ollama (`/api/generate`) and OpenAI-compatible chat completions,
//! with the same retry policy as the embedding clients.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use journal_harness_core::generation::GenerationProvider;

use crate::config::GenerationConfig;
use crate::embedding::post_json_with_retry;

/// Used when `generation.provider = "disabled"`.
pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn max_prompt_chars(&self) -> usize {
        0
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

/// Ollama non-streaming completion.
pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
    max_prompt_chars: usize,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            url: format!("{}/api/generate", base.trim_end_matches('/')),
            temperature: config.temperature,
            max_retries: config.max_retries,
            max_prompt_chars: config.max_prompt_chars,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn max_prompt_chars(&self) -> usize {
        self.max_prompt_chars
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let json = post_json_with_retry(
            &self.client,
            &self.url,
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;

        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing response field"))
    }
}

/// OpenAI chat completions. Requires `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    max_prompt_chars: usize,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            max_prompt_chars: config.max_prompt_chars,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn max_prompt_chars(&self) -> usize {
        self.max_prompt_chars
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let json = post_json_with_retry(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

/// Create the generator named by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_response_content() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Metformin [Source 1]." } }]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "Metformin [Source 1].");
        assert!(parse_chat_response(&serde_json::json!({ "choices": [] })).is_err());
    }

    #[tokio::test]
    async fn disabled_generator_errors() {
        let generator = create_generator(&GenerationConfig::default()).unwrap();
        assert_eq!(generator.model_name(), "disabled");
        assert!(generator.generate("hi").await.is_err());
    }

    #[test]
    fn ollama_requires_model() {
        let config = GenerationConfig {
            provider: "ollama".into(),
            ..GenerationConfig::default()
        };
        assert!(OllamaGenerator::new(&config).is_err());
    }
}
