use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::TextGenerator;
use crate::config::AiSection;
use crate::errors::AiError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for the Anthropic Messages API.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "is_blank")]
    system: &'a str,
    messages: [Message<'a>; 1],
}

fn is_blank(s: &&str) -> bool {
    s.trim().is_empty()
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn new(api_key: &str, model: &str, base_url: &str, timeout: Duration) -> Result<Self, AiError> {
        if api_key.trim().is_empty() {
            return Err(AiError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AiError::Transport)?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &AiSection) -> Result<Self, AiError> {
        let api_key = config.api_key.as_deref().ok_or(AiError::MissingApiKey)?;
        Self::new(
            api_key,
            &config.model,
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

/// Concatenate the text blocks of a Messages API response.
fn response_text(response: MessagesResponse) -> Result<String, AiError> {
    let text: String = response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        return Err(AiError::EmptyResponse);
    }
    Ok(text)
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        max_output: u32,
    ) -> Result<String, AiError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: max_output,
            system: system_context,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };

        let request = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();

        let resp = match tokio::time::timeout(self.timeout, request).await {
            Err(_) => {
                return Err(AiError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(AiError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
            Ok(Err(e)) => return Err(AiError::Transport(e)),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AiError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "AI service returned error status");
            return Err(AiError::Upstream {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed = resp
            .json::<MessagesResponse>()
            .await
            .map_err(AiError::Transport)?;
        response_text(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_key() {
        let result = AnthropicClient::new("  ", "m", "https://example.com", Duration::from_secs(1));
        assert!(matches!(result, Err(AiError::MissingApiKey)));
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = AiSection::default();
        assert!(matches!(
            AnthropicClient::from_config(&config),
            Err(AiError::MissingApiKey)
        ));

        let config = AiSection {
            api_key: Some("sk-test".to_string()),
            base_url: "https://example.com/".to_string(),
            ..Default::default()
        };
        let client = AnthropicClient::from_config(&config).unwrap();
        assert_eq!(client.messages_url(), "https://example.com/v1/messages");
        assert_eq!(client.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_request_body_shape() {
        let body = MessagesRequest {
            model: "claude-3-sonnet-20240229",
            max_tokens: 4000,
            system: "",
            messages: [Message {
                role: "user",
                content: "Build a todo app",
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["max_tokens"], 4000);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("system").is_none());
    }

    #[test]
    fn test_response_text_joins_text_blocks() {
        let response: MessagesResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "Hello, "},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "world"}
            ]
        }))
        .unwrap();
        assert_eq!(response_text(response).unwrap(), "Hello, world");
    }

    #[test]
    fn test_response_text_empty_is_error() {
        let response: MessagesResponse =
            serde_json::from_value(serde_json::json!({"content": []})).unwrap();
        assert!(matches!(response_text(response), Err(AiError::EmptyResponse)));
    }
}
