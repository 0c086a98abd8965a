//! Workflow template loading and per-job patching.
//!
//! The template is a ComfyUI API-format graph exported from the UI: a
//! JSON object keyed by node id. Its shape belongs to ComfyUI, so it is
//! treated as opaque apart from the fixed set of inputs written below.

use std::path::Path;

use comfybot_core::job::JobSpec;
use serde::Deserialize;
use serde_json::{json, Value};

/// Node ids the template is expected to contain.
pub mod nodes {
    pub const PROMPT_TEXT: &str = "6";
    pub const VAE_LOADER: &str = "10";
    pub const CLIP_LOADER: &str = "11";
    pub const SAMPLER_SELECT: &str = "16";
    pub const SCHEDULER: &str = "17";
    pub const GUIDER: &str = "22";
    pub const NOISE: &str = "25";
    pub const GUIDANCE: &str = "26";
    pub const LATENT_IMAGE: &str = "27";
    pub const SAVE_IMAGE: &str = "52";
    pub const UNET_LOADER: &str = "54";
    pub const LORA_LOADER: &str = "55";
    pub const PREVIEW_IMAGE: &str = "59";
}

/// Model files the workflow loads. Fixed per deployment, never per job.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelFiles {
    pub model: String,
    pub vae: String,
    pub clip_t5: String,
    pub clip_l: String,
}

/// Errors from loading or patching a workflow template.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid workflow JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Workflow must be a JSON object keyed by node id")]
    NotAnObject,

    #[error("Workflow is missing node {0}")]
    MissingNode(String),

    #[error("Workflow node {node} is missing input {input}")]
    MissingInput { node: String, input: String },
}

/// A loaded workflow graph. Cloned and patched for every job.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: Value,
}

impl WorkflowTemplate {
    /// Read and parse a workflow file.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let raw = std::fs::read_to_string(path).map_err(|source| WorkflowError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_value(serde_json::from_str(&raw)?)
    }

    pub fn from_value(graph: Value) -> Result<Self, WorkflowError> {
        if !graph.is_object() {
            return Err(WorkflowError::NotAnObject);
        }
        Ok(Self { graph })
    }

    /// Produce the graph to submit for one job.
    ///
    /// `spec.seed` must already be resolved; an unresolved seed is
    /// written as `0`.
    pub fn prepare(
        &self,
        spec: &JobSpec,
        models: &ModelFiles,
        save_images: bool,
    ) -> Result<Value, WorkflowError> {
        let mut graph = self.graph.clone();

        match &spec.lora {
            None => {
                remove_node(&mut graph, nodes::LORA_LOADER)?;
                // Route the guider straight from the UNET loader.
                let model_link = input_mut(&mut graph, nodes::GUIDER, "model")?;
                match model_link.get_mut(0) {
                    Some(source) => *source = json!(nodes::UNET_LOADER),
                    None => {
                        return Err(WorkflowError::MissingInput {
                            node: nodes::GUIDER.to_string(),
                            input: "model".to_string(),
                        })
                    }
                }
            }
            Some(lora) => {
                set_input(&mut graph, nodes::LORA_LOADER, "lora_name", json!(lora))?;
                set_input(
                    &mut graph,
                    nodes::LORA_LOADER,
                    "strength_model",
                    json!(spec.lora_strength),
                )?;
            }
        }

        // Keep exactly one output node.
        if save_images {
            remove_node(&mut graph, nodes::PREVIEW_IMAGE)?;
        } else {
            remove_node(&mut graph, nodes::SAVE_IMAGE)?;
        }

        set_input(&mut graph, nodes::UNET_LOADER, "unet_name", json!(models.model))?;
        set_input(&mut graph, nodes::VAE_LOADER, "vae_name", json!(models.vae))?;
        set_input(&mut graph, nodes::CLIP_LOADER, "clip_name1", json!(models.clip_t5))?;
        set_input(&mut graph, nodes::CLIP_LOADER, "clip_name2", json!(models.clip_l))?;

        set_input(&mut graph, nodes::PROMPT_TEXT, "text", json!(spec.prompt))?;
        set_input(&mut graph, nodes::NOISE, "noise_seed", json!(spec.seed.unwrap_or_default()))?;
        set_input(&mut graph, nodes::LATENT_IMAGE, "width", json!(spec.width))?;
        set_input(&mut graph, nodes::LATENT_IMAGE, "height", json!(spec.height))?;
        set_input(&mut graph, nodes::GUIDANCE, "guidance", json!(spec.cfg))?;
        set_input(&mut graph, nodes::SAMPLER_SELECT, "sampler_name", json!(spec.sampler))?;
        set_input(&mut graph, nodes::SCHEDULER, "scheduler", json!(spec.scheduler))?;
        set_input(&mut graph, nodes::SCHEDULER, "steps", json!(spec.steps))?;

        Ok(graph)
    }
}

/// Display title of a node (`_meta.title`), falling back to its class.
pub fn node_title<'a>(graph: &'a Value, node_id: &str) -> Option<&'a str> {
    let node = graph.get(node_id)?;
    node.pointer("/_meta/title")
        .or_else(|| node.get("class_type"))
        .and_then(Value::as_str)
}

fn remove_node(graph: &mut Value, node_id: &str) -> Result<(), WorkflowError> {
    graph
        .as_object_mut()
        .and_then(|nodes| nodes.remove(node_id))
        .map(|_| ())
        .ok_or_else(|| WorkflowError::MissingNode(node_id.to_string()))
}

fn inputs_mut<'a>(
    graph: &'a mut Value,
    node_id: &str,
) -> Result<&'a mut serde_json::Map<String, Value>, WorkflowError> {
    graph
        .get_mut(node_id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| WorkflowError::MissingNode(node_id.to_string()))
}

fn input_mut<'a>(
    graph: &'a mut Value,
    node_id: &str,
    input: &str,
) -> Result<&'a mut Value, WorkflowError> {
    inputs_mut(graph, node_id)?
        .get_mut(input)
        .ok_or_else(|| WorkflowError::MissingInput {
            node: node_id.to_string(),
            input: input.to_string(),
        })
}

fn set_input(graph: &mut Value, node_id: &str, input: &str, value: Value) -> Result<(), WorkflowError> {
    inputs_mut(graph, node_id)?.insert(input.to_string(), value);
    Ok(())
}
