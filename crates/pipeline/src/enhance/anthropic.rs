//! Prompt enhancement through the Anthropic Messages API.
//!
//! The system prompt of the requested type instructs the model to wrap
//! its answer in `<prompt>...</prompt>`; anything outside the tags is
//! discarded. Responses without the tags count as failed attempts.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::{EnhanceConfig, EnhanceError, PromptEnhancer};

pub const SERVICE_NAME: &str = "anthropic";

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20240620";
const API_VERSION: &str = "2023-06-01";

/// HTTP request timeout for a single completion.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

static PROMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<prompt>(.*?)</prompt>").expect("valid regex"));

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
    text: String,
}

pub struct AnthropicEnhancer {
    client: reqwest::Client,
    config: EnhanceConfig,
}

impl AnthropicEnhancer {
    pub fn new(client: reqwest::Client, config: EnhanceConfig) -> Self {
        Self { client, config }
    }

    /// [`ServiceConstructor`](super::ServiceConstructor) for the registry.
    pub fn create(config: &EnhanceConfig) -> Result<Arc<dyn PromptEnhancer>, EnhanceError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Arc::new(Self::new(client, config.clone())))
    }

    async fn complete(&self, prompt: &str, system_prompt: &str) -> Result<String, EnhanceError> {
        let body = serde_json::json!({
            "model": self.config.model.as_deref().unwrap_or(DEFAULT_MODEL),
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "system": system_prompt,
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": prompt}],
            }],
        });

        let base = self.config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        let response = self
            .client
            .post(format!("{}/v1/messages", base.trim_end_matches('/')))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(EnhanceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let message: MessagesResponse = response.json().await?;
        Ok(message
            .content
            .into_iter()
            .rev()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .unwrap_or_default())
    }
}

#[async_trait]
impl PromptEnhancer for AnthropicEnhancer {
    async fn enhance(&self, prompt: &str, kind: &str) -> Result<String, EnhanceError> {
        let type_config = self
            .config
            .types
            .get(kind)
            .ok_or_else(|| EnhanceError::UnknownType(kind.to_string()))?;

        let attempts = self.config.retries.max(1);
        for attempt in 1..=attempts {
            match self.complete(prompt, &type_config.system_prompt).await {
                Ok(text) => match extract_prompt(&text) {
                    Some(enhanced) => {
                        tracing::info!(kind, attempt, "Received enhanced prompt");
                        return Ok(enhanced);
                    }
                    None => {
                        tracing::warn!(kind, attempt, "No prompt found between <prompt> tags");
                    }
                },
                Err(e) => {
                    tracing::warn!(kind, attempt, error = %e, "Prompt enhancement attempt failed");
                }
            }
        }

        tracing::error!(kind, attempts, "Prompt enhancement failed after all attempts");
        Err(EnhanceError::Exhausted)
    }
}

/// Text between the first `<prompt>` and `</prompt>` pair, trimmed.
pub fn extract_prompt(text: &str) -> Option<String> {
    PROMPT_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn extracts_tagged_prompt() {
        let text = "Here you go:\n<prompt>\n  A misty harbour at dawn,\nfishing boats\n</prompt>\nEnjoy!";
        assert_eq!(
            extract_prompt(text).as_deref(),
            Some("A misty harbour at dawn,\nfishing boats")
        );
    }

    #[test]
    fn first_tag_pair_wins() {
        let text = "<prompt>one</prompt> <prompt>two</prompt>";
        assert_eq!(extract_prompt(text).as_deref(), Some("one"));
    }

    #[test]
    fn untagged_text_yields_none() {
        assert_eq!(extract_prompt("A misty harbour"), None);
        assert_eq!(extract_prompt("<prompt>unterminated"), None);
    }

    #[tokio::test]
    async fn unknown_type_fails_without_request() {
        let config: EnhanceConfig = toml::from_str(
            r#"
            service = "anthropic"
            api_base = "http://127.0.0.1:9"
            "#,
        )
        .unwrap();
        let enhancer = AnthropicEnhancer::new(reqwest::Client::new(), config);
        let result = enhancer.enhance("a cat", "poetic").await;
        assert_matches!(result, Err(EnhanceError::UnknownType(kind)) if kind == "poetic");
    }
}
