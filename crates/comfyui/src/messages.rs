//! Frames of the ComfyUI `/ws` event channel.
//!
//! Text frames are JSON objects `{"type": "...", "data": {...}}` and map
//! onto [`ComfyUIMessage`]. Binary frames carry sampler previews behind
//! an 8-byte header and are passed through as raw bytes.

use serde::Deserialize;

/// Bytes before the image payload of a binary preview frame: a
/// big-endian event type then a big-endian image format.
pub const PREVIEW_HEADER_LEN: usize = 8;

/// Event channel messages the bot reacts to.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    /// Queue depth broadcast, not tied to a prompt.
    Status(StatusData),
    ExecutionStart(PromptRef),
    /// Nodes whose outputs were reused from an earlier run.
    ExecutionCached(CachedNodes),
    /// `node` is the node now running; `None` means the prompt is done.
    Executing(NodeRunning),
    /// Sampler step counter.
    Progress(StepProgress),
    /// A node finished and reported its outputs.
    Executed(NodeOutput),
    ExecutionSuccess(PromptRef),
    ExecutionInterrupted(Interruption),
    ExecutionError(ExecutionFailure),
}

/// `type` values with a [`ComfyUIMessage`] variant.
const KNOWN_TYPES: &[&str] = &[
    "status",
    "execution_start",
    "execution_cached",
    "executing",
    "progress",
    "executed",
    "execution_success",
    "execution_interrupted",
    "execution_error",
];

impl ComfyUIMessage {
    /// The prompt this message is about. `None` for status broadcasts
    /// and for `progress` on servers that predate per-prompt progress.
    pub fn prompt_id(&self) -> Option<&str> {
        let id = match self {
            Self::Status(_) => return None,
            Self::ExecutionStart(d) | Self::ExecutionSuccess(d) => &d.prompt_id,
            Self::ExecutionCached(d) => &d.prompt_id,
            Self::Executing(d) => &d.prompt_id,
            Self::Progress(d) => &d.prompt_id,
            Self::Executed(d) => &d.prompt_id,
            Self::ExecutionInterrupted(d) => &d.prompt_id,
            Self::ExecutionError(d) => &d.prompt_id,
        };
        id.as_deref()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload that only names a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedNodes {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeRunning {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepProgress {
    /// 1-based.
    pub value: i32,
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeOutput {
    pub node: String,
    /// Node-specific, e.g. `{"images": [...]}` for image outputs.
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interruption {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Only the fields shown to users are kept; the traceback is dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionFailure {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// One frame of the event channel.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(ComfyUIMessage),
    /// Binary frame, header still attached.
    Binary(Vec<u8>),
}

/// Strict parse: unknown `type` values are an error.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Lenient parse for the live stream: frames of types without a
/// variant (custom-node chatter and the like) yield `Ok(None)`, while a
/// known type with a bad payload is still an error.
pub fn parse_frame(text: &str) -> Result<Option<ComfyUIMessage>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or_default();
    if !KNOWN_TYPES.contains(&kind) {
        return Ok(None);
    }
    serde_json::from_value(value).map(Some)
}

/// Image payload of a binary preview frame, or `None` if there is none.
pub fn preview_image_bytes(frame: &[u8]) -> Option<&[u8]> {
    frame
        .get(PREVIEW_HEADER_LEN..)
        .filter(|payload| !payload.is_empty())
}
