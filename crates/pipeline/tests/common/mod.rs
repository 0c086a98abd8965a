//! In-memory fakes of the engine, chat transport and enhancer.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use comfybot_comfyui::api::ComfyUIApiError;
use comfybot_comfyui::history::OutputImage;
use comfybot_comfyui::messages::{parse_message, StreamEvent};
use comfybot_comfyui::workflow::{ModelFiles, WorkflowTemplate};
use comfybot_core::job::{JobRecord, JobSpec};
use comfybot_core::modes::{ModeConfig, ModeRegistry};
use comfybot_core::params;
use comfybot_core::queue::UserQueueManager;
use comfybot_core::types::MessageRef;
use comfybot_pipeline::engine::{EngineError, EventStream, RenderingEngine};
use comfybot_pipeline::enhance::{EnhanceError, PromptEnhancer};
use comfybot_pipeline::media::MediaDir;
use comfybot_pipeline::pipeline::{GenerationPipeline, PipelineSettings};
use comfybot_pipeline::transport::{ChatTransport, RetryPolicy, TextFormat, TransportError};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tempfile::TempDir;

pub const USER: i64 = 7;
pub const PROMPT_ID: &str = "p1";

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

pub fn msg(json: serde_json::Value) -> StreamEvent {
    StreamEvent::Message(parse_message(&json.to_string()).unwrap())
}

pub fn executing(node: Option<&str>, prompt_id: &str) -> StreamEvent {
    msg(json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}}))
}

pub fn progress(value: i32, max: i32, prompt_id: &str) -> StreamEvent {
    msg(json!({"type": "progress", "data": {"value": value, "max": max, "prompt_id": prompt_id, "node": "13"}}))
}

pub fn executed(node: &str, prompt_id: &str) -> StreamEvent {
    msg(json!({"type": "executed", "data": {"node": node, "output": {}, "prompt_id": prompt_id}}))
}

pub fn cached(prompt_id: &str) -> StreamEvent {
    msg(json!({"type": "execution_cached", "data": {"nodes": ["10", "11"], "prompt_id": prompt_id}}))
}

pub fn success(prompt_id: &str) -> StreamEvent {
    msg(json!({"type": "execution_success", "data": {"prompt_id": prompt_id}}))
}

pub fn started(prompt_id: &str) -> StreamEvent {
    msg(json!({"type": "execution_start", "data": {"prompt_id": prompt_id}}))
}

pub fn status() -> StreamEvent {
    msg(json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 2}}}}))
}

pub fn error(prompt_id: &str, kind: &str, message: &str) -> StreamEvent {
    msg(json!({
        "type": "execution_error",
        "data": {
            "prompt_id": prompt_id,
            "node_id": "13",
            "node_type": "SamplerCustomAdvanced",
            "exception_type": kind,
            "exception_message": message,
        }
    }))
}

/// Binary preview frame: 8-byte header then a PNG.
pub fn preview() -> StreamEvent {
    let mut frame = vec![0, 0, 0, 1, 0, 0, 0, 2];
    frame.extend(png_bytes());
    StreamEvent::Binary(frame)
}

pub fn png_bytes() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image::RgbImage::from_pixel(4, 4, image::Rgb([0, 128, 255]))
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// A full successful run of the sample workflow.
pub fn successful_run() -> Vec<StreamEvent> {
    vec![
        status(),
        executing(Some("54"), PROMPT_ID),
        progress(1, 4, PROMPT_ID),
        preview(),
        progress(2, 4, PROMPT_ID),
        progress(3, 4, PROMPT_ID),
        progress(4, 4, PROMPT_ID),
        executed("52", PROMPT_ID),
        success(PROMPT_ID),
    ]
}

pub fn history_with_image() -> serde_json::Value {
    json!({
        PROMPT_ID: {
            "outputs": {
                "52": {"images": [{"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"}]}
            }
        }
    })
}

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    OpenEvents(String),
    Submit(serde_json::Value),
    Interrupt,
    Dequeue(String),
    FetchHistory(String),
    FetchImage(OutputImage),
}

/// Scripted engine: every `open_events` replays the same frames.
pub struct FakeEngine {
    frames: Vec<StreamEvent>,
    history: serde_json::Value,
    image: Vec<u8>,
    fail_submits: AtomicUsize,
    cancel_at: Mutex<Option<(usize, Arc<JobRecord>)>>,
    pub calls: Mutex<Vec<EngineCall>>,
}

impl FakeEngine {
    pub fn new(frames: Vec<StreamEvent>) -> Self {
        Self {
            frames,
            history: history_with_image(),
            image: png_bytes(),
            fail_submits: AtomicUsize::new(0),
            cancel_at: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history(mut self, history: serde_json::Value) -> Self {
        self.history = history;
        self
    }

    /// Make the next `n` submissions fail with an API error.
    pub fn failing_submits(self, n: usize) -> Self {
        self.fail_submits.store(n, Ordering::SeqCst);
        self
    }

    /// Cancel `record` just before frame `index` is delivered.
    pub fn cancel_before_frame(&self, index: usize, record: Arc<JobRecord>) {
        *self.cancel_at.lock().unwrap() = Some((index, record));
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<serde_json::Value> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Submit(workflow) => Some(workflow),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RenderingEngine for FakeEngine {
    async fn open_events(&self, client_id: &str) -> Result<EventStream, EngineError> {
        self.record(EngineCall::OpenEvents(client_id.to_string()));
        let cancel_at = self.cancel_at.lock().unwrap().clone();
        let frames = self.frames.clone().into_iter().enumerate();
        Ok(stream::iter(frames)
            .map(move |(index, frame)| {
                if let Some((at, record)) = &cancel_at {
                    if *at == index {
                        record.cancel();
                    }
                }
                Ok::<_, EngineError>(frame)
            })
            .boxed())
    }

    async fn submit(
        &self,
        workflow: &serde_json::Value,
        _client_id: &str,
    ) -> Result<String, EngineError> {
        self.record(EngineCall::Submit(workflow.clone()));
        let remaining = self.fail_submits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_submits.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Api(ComfyUIApiError::Rejected {
                status: 400,
                body: "prompt_outputs_failed_validation".to_string(),
            }));
        }
        Ok(PROMPT_ID.to_string())
    }

    async fn interrupt(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Interrupt);
        Ok(())
    }

    async fn dequeue(&self, prompt_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Dequeue(prompt_id.to_string()));
        Ok(())
    }

    async fn fetch_history(&self, prompt_id: &str) -> Result<serde_json::Value, EngineError> {
        self.record(EngineCall::FetchHistory(prompt_id.to_string()));
        Ok(self.history.clone())
    }

    async fn fetch_image(&self, image: &OutputImage) -> Result<Vec<u8>, EngineError> {
        self.record(EngineCall::FetchImage(image.clone()));
        Ok(self.image.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCall {
    ReplyText { text: String, format: TextFormat },
    ReplyPhoto { caption: String, file_existed: bool },
    EditText { message_id: i64, text: String, format: TextFormat },
    EditCaption { message_id: i64, caption: String },
    EditMedia { message_id: i64, caption: String, format: TextFormat, file_existed: bool },
}

#[derive(Default)]
pub struct FakeTransport {
    next_message_id: AtomicI64,
    pub calls: Mutex<Vec<ChatCall>>,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn captions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::EditCaption { caption, .. } => Some(caption),
                _ => None,
            })
            .collect()
    }

    pub fn media_edits(&self) -> Vec<(String, TextFormat, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::EditMedia { caption, format, file_existed, .. } => {
                    Some((caption, format, file_existed))
                }
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: ChatCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn sent(&self, to: MessageRef) -> MessageRef {
        let id = 1000 + self.next_message_id.fetch_add(1, Ordering::SeqCst);
        MessageRef::new(to.chat_id, id)
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn reply_text(
        &self,
        to: MessageRef,
        text: &str,
        format: TextFormat,
    ) -> Result<MessageRef, TransportError> {
        self.push(ChatCall::ReplyText {
            text: text.to_string(),
            format,
        });
        Ok(self.sent(to))
    }

    async fn reply_photo(
        &self,
        to: MessageRef,
        photo: &Path,
        caption: &str,
        _format: TextFormat,
    ) -> Result<MessageRef, TransportError> {
        self.push(ChatCall::ReplyPhoto {
            caption: caption.to_string(),
            file_existed: photo.exists(),
        });
        Ok(self.sent(to))
    }

    async fn edit_text(
        &self,
        message: MessageRef,
        text: &str,
        format: TextFormat,
    ) -> Result<(), TransportError> {
        self.push(ChatCall::EditText {
            message_id: message.message_id,
            text: text.to_string(),
            format,
        });
        Ok(())
    }

    async fn edit_caption(
        &self,
        message: MessageRef,
        caption: &str,
        _format: TextFormat,
    ) -> Result<(), TransportError> {
        self.push(ChatCall::EditCaption {
            message_id: message.message_id,
            caption: caption.to_string(),
        });
        Ok(())
    }

    async fn edit_media(
        &self,
        message: MessageRef,
        photo: &Path,
        caption: &str,
        format: TextFormat,
    ) -> Result<(), TransportError> {
        self.push(ChatCall::EditMedia {
            message_id: message.message_id,
            caption: caption.to_string(),
            format,
            file_existed: photo.exists(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeEnhancer
// ---------------------------------------------------------------------------

/// Returns a fixed rewrite, or fails, and records the prompts it saw.
pub struct FakeEnhancer {
    reply: Option<String>,
    pub seen: Mutex<Vec<(String, String)>>,
    cancels: Mutex<Option<Arc<JobRecord>>>,
}

impl FakeEnhancer {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            seen: Mutex::new(Vec::new()),
            cancels: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            seen: Mutex::new(Vec::new()),
            cancels: Mutex::new(None),
        }
    }

    /// Cancel `record` while the rewrite is in flight.
    pub fn cancel_during_call(&self, record: Arc<JobRecord>) {
        *self.cancels.lock().unwrap() = Some(record);
    }
}

#[async_trait]
impl PromptEnhancer for FakeEnhancer {
    async fn enhance(&self, prompt: &str, kind: &str) -> Result<String, EnhanceError> {
        self.seen
            .lock()
            .unwrap()
            .push((prompt.to_string(), kind.to_string()));
        if let Some(record) = self.cancels.lock().unwrap().as_ref() {
            record.cancel();
        }
        self.reply.clone().ok_or(EnhanceError::Exhausted)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn models() -> ModelFiles {
    ModelFiles {
        model: "flux1-dev.safetensors".to_string(),
        vae: "ae.safetensors".to_string(),
        clip_t5: "t5xxl_fp16.safetensors".to_string(),
        clip_l: "clip_l.safetensors".to_string(),
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        models: models(),
        save_images: true,
        preview_every_n_steps: 1,
    }
}

pub fn workflow() -> WorkflowTemplate {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../workflows/flux_dev.json");
    WorkflowTemplate::load(&path).unwrap()
}

/// Modes used by the tests: the built-in default plus `photo`.
pub fn modes() -> ModeRegistry {
    let mut modes = BTreeMap::new();
    modes.insert(
        "photo".to_string(),
        ModeConfig {
            prompt_template_pre_pe: "photo of {}".to_string(),
            prompt_template_post_pe: "{}, 35mm film".to_string(),
            ..ModeConfig::default()
        },
    );
    ModeRegistry::new(modes).unwrap()
}

pub fn spec(text: &str) -> JobSpec {
    params::parse(USER, text, &modes()).unwrap()
}

pub fn origin() -> MessageRef {
    MessageRef::new(USER, 1)
}

pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub transport: Arc<FakeTransport>,
    pub queues: Arc<UserQueueManager>,
    pub pipeline: Arc<GenerationPipeline>,
    pub media: TempDir,
}

impl Harness {
    pub fn new(engine: FakeEngine) -> Self {
        Self::build(engine, settings(), None)
    }

    pub fn build(
        engine: FakeEngine,
        settings: PipelineSettings,
        enhancer: Option<Arc<FakeEnhancer>>,
    ) -> Self {
        let engine = Arc::new(engine);
        let transport = Arc::new(FakeTransport::default());
        let media = tempfile::tempdir().unwrap();
        let mut pipeline = GenerationPipeline::new(
            engine.clone(),
            transport.clone(),
            workflow(),
            settings,
            MediaDir::new(media.path()).unwrap(),
        )
        .with_retry_policy(RetryPolicy::new(vec![Duration::ZERO; 3]));
        if let Some(enhancer) = enhancer {
            pipeline = pipeline.with_enhancer(enhancer);
        }
        Self {
            engine,
            transport,
            queues: Arc::new(UserQueueManager::new()),
            pipeline: Arc::new(pipeline),
            media,
        }
    }

    /// Enqueue `text` and return the created records.
    pub async fn enqueue(&self, text: &str) -> Vec<Arc<JobRecord>> {
        self.queues.enqueue(USER, spec(text), origin()).await.records
    }

    /// Files left behind in the media directory.
    pub fn leftover_files(&self) -> usize {
        std::fs::read_dir(self.media.path()).unwrap().count()
    }
}
