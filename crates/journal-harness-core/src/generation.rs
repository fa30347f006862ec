//! Text generation provider trait.
//!
//! Concrete clients (Ollama, OpenAI-compatible chat) live in the app crate.

use anyhow::Result;
use async_trait::async_trait;

/// A text-generation backend: prompt in, text out.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"llama3.1:8b"`).
    fn model_name(&self) -> &str;
    /// Largest prompt, in characters, the service accepts.
    fn max_prompt_chars(&self) -> usize;
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String>;
}
