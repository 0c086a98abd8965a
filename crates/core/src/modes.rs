//! Generation modes: named bundles of default sampling parameters.
//!
//! Modes are loaded once from configuration and are read-only
//! afterwards. The `default` mode is built in and never appears in the
//! loaded mapping.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::CoreError;

/// Name of the built-in mode.
pub const DEFAULT_MODE: &str = "default";

/// The single substitution slot a prompt template must contain.
pub const TEMPLATE_SLOT: &str = "{}";

/// Default sampling parameters for one mode.
///
/// Every field is optional in configuration; missing fields fall back
/// to the built-in default mode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub cfg: f64,
    pub steps: u32,
    pub lora: Option<String>,
    pub lora_strength: f64,
    pub sampler: String,
    pub scheduler: String,
    /// Applied to the raw prompt before enhancement.
    pub prompt_template_pre_pe: String,
    /// Applied to the (possibly enhanced) prompt before rendering.
    pub prompt_template_post_pe: String,
    pub description: Option<String>,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            cfg: 3.5,
            steps: 20,
            lora: None,
            lora_strength: 1.0,
            sampler: "euler".to_string(),
            scheduler: "simple".to_string(),
            prompt_template_pre_pe: TEMPLATE_SLOT.to_string(),
            prompt_template_post_pe: TEMPLATE_SLOT.to_string(),
            description: None,
        }
    }
}

impl ModeConfig {
    /// Check the invariants a mode must satisfy to be usable.
    pub fn validate(&self, name: &str) -> Result<(), CoreError> {
        if self.cfg <= 0.0 {
            return Err(CoreError::Validation(format!(
                "Mode '{name}': cfg must be greater than 0 (got {})",
                self.cfg
            )));
        }
        if self.steps == 0 {
            return Err(CoreError::Validation(format!(
                "Mode '{name}': steps must be greater than 0"
            )));
        }
        for (field, template) in [
            ("prompt_template_pre_pe", &self.prompt_template_pre_pe),
            ("prompt_template_post_pe", &self.prompt_template_post_pe),
        ] {
            let slots = template.matches(TEMPLATE_SLOT).count();
            if slots != 1 {
                return Err(CoreError::Validation(format!(
                    "Mode '{name}': {field} must contain exactly one '{TEMPLATE_SLOT}' slot (found {slots})"
                )));
            }
        }
        Ok(())
    }
}

/// Substitute `text` into the template's `{}` slot.
pub fn apply_template(template: &str, text: &str) -> String {
    template.replacen(TEMPLATE_SLOT, text, 1)
}

/// Lookup table from mode name to [`ModeConfig`].
#[derive(Debug, Clone, Default)]
pub struct ModeRegistry {
    modes: BTreeMap<String, ModeConfig>,
}

impl ModeRegistry {
    /// Build a registry from the configured modes, validating each one.
    ///
    /// The name `default` is reserved for the built-in mode.
    pub fn new(modes: BTreeMap<String, ModeConfig>) -> Result<Self, CoreError> {
        if modes.contains_key(DEFAULT_MODE) {
            return Err(CoreError::Validation(format!(
                "Mode name '{DEFAULT_MODE}' is reserved for the built-in mode"
            )));
        }
        for (name, mode) in &modes {
            mode.validate(name)?;
        }
        Ok(Self { modes })
    }

    /// Resolve a mode by name. `default` always resolves.
    pub fn resolve(&self, name: &str) -> Result<ModeConfig, CoreError> {
        if name == DEFAULT_MODE {
            return Ok(ModeConfig::default());
        }
        self.modes
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::InvalidParameter(format!("Invalid mode {name}")))
    }

    /// All modes, the built-in default first, then configured modes by name.
    pub fn all(&self) -> Vec<(String, ModeConfig)> {
        std::iter::once((DEFAULT_MODE.to_string(), ModeConfig::default()))
            .chain(
                self.modes
                    .iter()
                    .map(|(name, mode)| (name.clone(), mode.clone())),
            )
            .collect()
    }
}
