//! AI text-generation capability used by the PRD, decomposition and
//! code-generation stages.

pub mod client;
pub mod prompts;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::AiSection;
use crate::errors::AiError;

pub use client::AnthropicClient;

/// A single-method capability: turn a prompt into text.
///
/// Implementations must bound the call with a timeout so one stage cannot
/// stall a run indefinitely.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        max_output: u32,
    ) -> Result<String, AiError>;
}

/// Stands in for the client when no API key is configured. Every call fails.
pub struct UnconfiguredGenerator;

#[async_trait]
impl TextGenerator for UnconfiguredGenerator {
    async fn generate(&self, _: &str, _: &str, _: u32) -> Result<String, AiError> {
        Err(AiError::MissingApiKey)
    }
}

/// Build the generator for `config`, or a failing stand-in without a key.
pub fn generator_from_config(config: &AiSection) -> Result<Arc<dyn TextGenerator>, AiError> {
    match AnthropicClient::from_config(config) {
        Ok(client) => Ok(Arc::new(client)),
        Err(AiError::MissingApiKey) => {
            warn!("ANTHROPIC_API_KEY is not set; AI stages will fail until it is configured");
            Ok(Arc::new(UnconfiguredGenerator))
        }
        Err(e) => Err(e),
    }
}

/// True when an API key is available from config or environment.
pub fn is_configured(config: &AiSection) -> bool {
    config
        .api_key
        .as_deref()
        .is_some_and(|key| !key.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_yields_failing_generator() {
        let config = AiSection::default();
        assert!(!is_configured(&config));
        let generator = generator_from_config(&config).unwrap();
        let result = generator.generate("hello", "", 10).await;
        assert!(matches!(result, Err(AiError::MissingApiKey)));
    }

    #[test]
    fn test_key_counts_as_configured() {
        let config = AiSection {
            api_key: Some("sk-test".to_string()),
            ..AiSection::default()
        };
        assert!(is_configured(&config));
        assert!(generator_from_config(&config).is_ok());
    }
}
