//! Lookup of rendered images in ComfyUI's `/history/{prompt_id}` output.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Reference to one image produced by an output node, as listed in
/// the history manifest. Passed back to `/view` to fetch the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage folder: `output` for saved images, `temp` for previews.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: BTreeMap<String, NodeOutput>,
}

#[derive(Debug, Deserialize)]
struct NodeOutput {
    #[serde(default)]
    images: Vec<OutputImage>,
}

/// Find the first image of the first output node that produced any.
///
/// `history` is the raw `/history/{prompt_id}` response, keyed by
/// prompt id. Returns `None` when the prompt is absent or produced no
/// images.
pub fn find_first_image(history: &serde_json::Value, prompt_id: &str) -> Option<OutputImage> {
    let entry = history.get(prompt_id)?;
    let entry = HistoryEntry::deserialize(entry)
        .map_err(|e| tracing::warn!(prompt_id, error = %e, "Unreadable history entry"))
        .ok()?;
    entry
        .outputs
        .into_values()
        .find_map(|output| output.images.into_iter().next())
}
