//! Prompt enhancement: rewriting a user's prompt through a language model
//! before rendering.
//!
//! Services are looked up by name in a [`ServiceRegistry`] populated at
//! startup. Each registered constructor builds a [`PromptEnhancer`] from
//! the shared [`EnhanceConfig`].

pub mod anthropic;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

/// Errors from prompt enhancement.
#[derive(Debug, thiserror::Error)]
pub enum EnhanceError {
    #[error("Invalid prompt enhancement type '{0}'")]
    UnknownType(String),

    #[error("Prompt enhancement service '{name}' not found. Available services: {available}")]
    UnknownService { name: String, available: String },

    #[error("Prompt enhancement is not configured")]
    NotConfigured,

    #[error("Failed to generate enhanced prompt, please try again later.")]
    Exhausted,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Enhancement API error ({status}): {body}")]
    Api { status: u16, body: String },
}

#[async_trait]
pub trait PromptEnhancer: Send + Sync {
    /// Rewrite `prompt` using the enhancement type `kind`.
    async fn enhance(&self, prompt: &str, kind: &str) -> Result<String, EnhanceError>;
}

/// One enhancement type: a system prompt plus a help-text description.
#[derive(Debug, Clone, Deserialize)]
pub struct EnhanceTypeConfig {
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
}

/// The `[prompt_enhancement]` config table.
#[derive(Debug, Clone, Deserialize)]
pub struct EnhanceConfig {
    /// Registered service name, e.g. `anthropic`.
    pub service: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f64,
    /// Attempts per enhancement before giving up.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub types: BTreeMap<String, EnhanceTypeConfig>,
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_retries() -> u32 {
    3
}

/// Builds an enhancer from config.
pub type ServiceConstructor = fn(&EnhanceConfig) -> Result<Arc<dyn PromptEnhancer>, EnhanceError>;

/// Name -> constructor mapping for enhancement services.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<&'static str, ServiceConstructor>,
}

impl ServiceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every service shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(anthropic::SERVICE_NAME, anthropic::AnthropicEnhancer::create);
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: ServiceConstructor) {
        self.services.insert(name, constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.services.keys().copied().collect()
    }

    /// Build the service named by `config.service`.
    pub fn create(&self, config: &EnhanceConfig) -> Result<Arc<dyn PromptEnhancer>, EnhanceError> {
        let constructor =
            self.services
                .get(config.service.as_str())
                .ok_or_else(|| EnhanceError::UnknownService {
                    name: config.service.clone(),
                    available: self.names().join(", "),
                })?;
        constructor(config)
    }
}
