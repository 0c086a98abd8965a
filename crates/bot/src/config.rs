//! Bot configuration loaded from a TOML file.
//!
//! | Env Var              | Default        | Meaning                         |
//! |----------------------|----------------|---------------------------------|
//! | `COMFYBOT_CONFIG`    | `config.toml`  | path of the configuration file  |
//! | `TELEGRAM_BOT_TOKEN` | (from file)    | overrides `[telegram] token`    |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use comfybot_comfyui::workflow::ModelFiles;
use comfybot_core::error::CoreError;
use comfybot_core::modes::{ModeConfig, ModeRegistry};
use comfybot_pipeline::enhance::{EnhanceConfig, ServiceRegistry};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Mode(#[from] CoreError),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    pub image_generation: ImageGenerationConfig,
    #[serde(default)]
    pub prompt_enhancement: Option<EnhanceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    /// Long-poll timeout for `getUpdates`.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenerationConfig {
    pub model: String,
    pub vae: String,
    pub clip_t5: String,
    pub clip_l: String,
    /// ComfyUI HTTP base URL, e.g. `http://127.0.0.1:8188`.
    pub server_url: String,
    /// ComfyUI WebSocket URL, e.g. `ws://127.0.0.1:8188/ws`.
    pub websocket_url: String,
    pub workflow_path: PathBuf,
    #[serde(default)]
    pub save_images: bool,
    #[serde(default = "default_preview_every_n_steps")]
    pub update_preview_every_n_steps: u32,
    /// Where placeholder, preview and result files are written.
    /// Defaults to a directory under the system temp dir.
    #[serde(default)]
    pub media_dir: Option<PathBuf>,
    #[serde(default)]
    pub modes: BTreeMap<String, ModeConfig>,
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_preview_every_n_steps() -> u32 {
    1
}

impl ImageGenerationConfig {
    pub fn model_files(&self) -> ModelFiles {
        ModelFiles {
            model: self.model.clone(),
            vae: self.vae.clone(),
            clip_t5: self.clip_t5.clone(),
            clip_l: self.clip_l.clone(),
        }
    }
}

impl Config {
    /// Load from `COMFYBOT_CONFIG` (or `config.toml`), then apply
    /// environment overrides and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("COMFYBOT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::load(Path::new(&path))?;
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            config.telegram.token = token;
        }
        config.validate(&ServiceRegistry::builtin())?;
        Ok(config)
    }

    /// Read and parse a config file without validating it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Check everything that would otherwise fail at first use.
    pub fn validate(&self, services: &ServiceRegistry) -> Result<(), ConfigError> {
        if self.telegram.token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "telegram.token is empty (set it in the config file or TELEGRAM_BOT_TOKEN)".into(),
            ));
        }
        if self.image_generation.update_preview_every_n_steps == 0 {
            return Err(ConfigError::Invalid(
                "image_generation.update_preview_every_n_steps must be at least 1".into(),
            ));
        }
        self.modes()?;
        if let Some(pe) = &self.prompt_enhancement {
            if !services.contains(&pe.service) {
                return Err(ConfigError::Invalid(format!(
                    "Unknown prompt enhancement service '{}'. Available services: {}",
                    pe.service,
                    services.names().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// The configured modes as a validated registry.
    pub fn modes(&self) -> Result<ModeRegistry, ConfigError> {
        Ok(ModeRegistry::new(self.image_generation.modes.clone())?)
    }

    /// `(name, description)` of every configured enhancement type.
    pub fn enhance_types(&self) -> Vec<(String, String)> {
        self.prompt_enhancement
            .iter()
            .flat_map(|pe| pe.types.iter())
            .map(|(name, kind)| (name.clone(), kind.description.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const SAMPLE: &str = r#"
[telegram]
token = "123:abc"

[logger]
debug = true

[image_generation]
model = "flux1-dev.safetensors"
vae = "ae.safetensors"
clip_t5 = "t5xxl_fp16.safetensors"
clip_l = "clip_l.safetensors"
server_url = "http://127.0.0.1:8188"
websocket_url = "ws://127.0.0.1:8188/ws"
workflow_path = "workflows/flux_dev.json"
save_images = true
update_preview_every_n_steps = 4

[image_generation.modes.real]
cfg = 2.0
lora = "realism.safetensors"
lora_strength = 0.8
prompt_template_post_pe = "photo, {}"
description = "Photorealistic"

[prompt_enhancement]
service = "anthropic"
api_key = "sk-test"
retries = 2

[prompt_enhancement.types.default]
description = "General purpose rewrite"
system_prompt = "Rewrite the prompt."
"#;

    #[test]
    fn sample_config_parses_with_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.telegram.poll_timeout_secs, 30);
        assert_eq!(config.telegram.api_url, "https://api.telegram.org");
        assert!(config.logger.debug);
        assert_eq!(config.image_generation.update_preview_every_n_steps, 4);

        let real = &config.image_generation.modes["real"];
        assert_eq!(real.cfg, 2.0);
        assert_eq!(real.steps, 20);
        assert_eq!(real.sampler, "euler");
        assert_eq!(real.prompt_template_pre_pe, "{}");

        let pe = config.prompt_enhancement.as_ref().unwrap();
        assert_eq!(pe.max_tokens, 1000);
        assert_eq!(pe.retries, 2);
        assert_eq!(
            config.enhance_types(),
            vec![("default".to_string(), "General purpose rewrite".to_string())]
        );

        config.validate(&ServiceRegistry::builtin()).unwrap();
    }

    #[test]
    fn enhancement_section_is_optional() {
        let raw = SAMPLE.split("[prompt_enhancement]").next().unwrap();
        let config = Config::from_toml(raw).unwrap();
        assert!(config.prompt_enhancement.is_none());
        assert!(config.enhance_types().is_empty());
        config.validate(&ServiceRegistry::builtin()).unwrap();
    }

    #[test]
    fn unknown_service_is_rejected() {
        let raw = SAMPLE.replace("service = \"anthropic\"", "service = \"nope\"");
        let config = Config::from_toml(&raw).unwrap();
        assert_matches!(
            config.validate(&ServiceRegistry::builtin()),
            Err(ConfigError::Invalid(msg)) if msg.contains("'nope'") && msg.contains("anthropic")
        );
    }

    #[test]
    fn template_without_slot_is_rejected() {
        let raw = SAMPLE.replace("\"photo, {}\"", "\"photo\"");
        let config = Config::from_toml(&raw).unwrap();
        assert_matches!(
            config.validate(&ServiceRegistry::builtin()),
            Err(ConfigError::Mode(CoreError::Validation(_)))
        );
    }

    #[test]
    fn redefining_default_mode_is_rejected() {
        let raw = SAMPLE.replace("[image_generation.modes.real]", "[image_generation.modes.default]");
        let config = Config::from_toml(&raw).unwrap();
        assert_matches!(config.modes(), Err(ConfigError::Mode(CoreError::Validation(_))));
    }

    #[test]
    fn zero_preview_interval_is_rejected() {
        let raw = SAMPLE.replace("update_preview_every_n_steps = 4", "update_preview_every_n_steps = 0");
        let config = Config::from_toml(&raw).unwrap();
        assert_matches!(config.validate(&ServiceRegistry::builtin()), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        );
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.telegram.token, "123:abc");
    }
}
