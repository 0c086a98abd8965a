//! The generation pipeline: drives one [`JobRecord`] from prompt
//! templating to the final photo.
//!
//! Stages: templating and optional enhancement, seed resolution,
//! submission, event streaming, result fetch and report. Status updates
//! go to a single placeholder photo message that is edited in place.
//!
//! Cancellation is cooperative: the record's flag is polled before each
//! stream event. A job the engine has started is interrupted, one still
//! waiting in the engine's queue is deleted from it.

use std::sync::Arc;

use comfybot_comfyui::history::find_first_image;
use comfybot_comfyui::messages::{preview_image_bytes, ComfyUIMessage, StreamEvent};
use comfybot_comfyui::workflow::{node_title, ModelFiles, WorkflowTemplate};
use comfybot_core::job::{JobRecord, JobStage};
use comfybot_core::markup::{escape_markdown_v2_code, truncate_chars};
use comfybot_core::modes::apply_template;
use comfybot_core::types::MessageRef;
use futures::StreamExt;

use crate::engine::{EventStream, RenderingEngine};
use crate::enhance::{EnhanceError, PromptEnhancer};
use crate::error::PipelineError;
use crate::media::MediaDir;
use crate::transport::{ChatTransport, Reporter, RetryPolicy, TextFormat};

pub const PREPARING_CAPTION: &str = "Preparing to generate image...";
pub const WAITING_FOR_ENHANCEMENT: &str = "Waiting for enhanced prompt...";
pub const CANCELLED_CAPTION: &str = "Image generation cancelled.";
pub const INTERRUPTED_CAPTION: &str = "Image generation was interrupted.";
pub const FETCHING_CAPTION: &str = "Image generation complete. Fetching final result...";
pub const NO_IMAGE_CAPTION: &str = "Failed to generate image.";
pub const CACHED_CAPTION: &str = "Using cached execution...";

/// Telegram's limit on photo captions.
pub const MAX_CAPTION_CHARS: usize = 1024;

/// Deployment-wide generation settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub models: ModelFiles,
    /// Keep results in ComfyUI's output folder rather than as temp previews.
    pub save_images: bool,
    /// Show a preview every N sampler steps (N >= 1).
    pub preview_every_n_steps: u32,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// How the event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Succeeded,
    Cancelled,
    Failed,
}

/// Tracks the current [`JobStage`] for logging.
struct StageTracker {
    job_id: u64,
    stage: JobStage,
}

impl StageTracker {
    fn new(job_id: u64) -> Self {
        Self {
            job_id,
            stage: JobStage::Queued,
        }
    }

    fn enter(&mut self, next: JobStage) {
        if !self.stage.can_transition_to(next) {
            tracing::warn!(job_id = self.job_id, from = ?self.stage, to = ?next, "Unexpected stage transition");
        }
        tracing::debug!(job_id = self.job_id, stage = ?next, "Job stage");
        self.stage = next;
    }

    fn finish(&mut self, outcome: JobOutcome) -> JobOutcome {
        if !self.stage.is_terminal() {
            self.enter(match outcome {
                JobOutcome::Completed => JobStage::Done,
                JobOutcome::Cancelled => JobStage::Cancelled,
                JobOutcome::Failed => JobStage::Failed,
            });
        }
        outcome
    }
}

pub struct GenerationPipeline {
    engine: Arc<dyn RenderingEngine>,
    transport: Arc<dyn ChatTransport>,
    enhancer: Option<Arc<dyn PromptEnhancer>>,
    workflow: WorkflowTemplate,
    settings: PipelineSettings,
    media: MediaDir,
    retry: RetryPolicy,
}

impl GenerationPipeline {
    pub fn new(
        engine: Arc<dyn RenderingEngine>,
        transport: Arc<dyn ChatTransport>,
        workflow: WorkflowTemplate,
        settings: PipelineSettings,
        media: MediaDir,
    ) -> Self {
        Self {
            engine,
            transport,
            enhancer: None,
            workflow,
            settings,
            media,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn PromptEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn reporter(&self) -> Reporter<'_> {
        Reporter::new(self.transport.as_ref(), &self.retry)
    }

    /// Drive `record` to completion. Never fails: every error is logged
    /// and reported to the user, and the caller advances the queue.
    pub async fn run(&self, record: &JobRecord) -> JobOutcome {
        let mut stages = StageTracker::new(record.id());
        let mut status = None;

        match self.drive(record, &mut stages, &mut status).await {
            Ok(outcome) => stages.finish(outcome),
            Err(e) => {
                tracing::error!(
                    user_id = record.user_id(),
                    job_id = record.id(),
                    stage = ?stages.stage,
                    error = %e,
                    "While generating image an error occurred",
                );
                let text = format!("An error occurred: {e}");
                let reporter = self.reporter();
                match status {
                    Some(message) => reporter.edit_caption(message, &text, TextFormat::Plain).await,
                    None => {
                        reporter.reply_text(record.origin(), &text, TextFormat::Plain).await;
                    }
                }
                stages.finish(JobOutcome::Failed)
            }
        }
    }

    async fn drive(
        &self,
        record: &JobRecord,
        stages: &mut StageTracker,
        status: &mut Option<MessageRef>,
    ) -> Result<JobOutcome, PipelineError> {
        let mut spec = record.spec().clone();
        let user_id = spec.user_id;
        let reporter = self.reporter();

        tracing::info!(
            user_id,
            job_id = record.id(),
            queued_at = %record.created_at(),
            "Generation started",
        );

        let mut prompt = apply_template(&spec.prompt_template_pre_pe, &spec.prompt);
        if let Some(kind) = spec.prompt_enhance.clone() {
            stages.enter(JobStage::Enhancing);
            match self.enhance(record, &prompt, &kind).await {
                Some(enhanced) => prompt = enhanced,
                None => return Ok(JobOutcome::Failed),
            }
        }
        spec.prompt = apply_template(&spec.prompt_template_post_pe, &prompt);

        if record.is_cancelled() {
            tracing::info!(user_id, job_id = record.id(), "Generation cancelled before submission");
            reporter
                .reply_text(record.origin(), CANCELLED_CAPTION, TextFormat::Plain)
                .await;
            return Ok(JobOutcome::Cancelled);
        }
        let seed = spec.resolve_seed();

        stages.enter(JobStage::Submitting);
        let placeholder = self
            .media
            .write_placeholder(user_id, record.id(), spec.width, spec.height)?;
        let message = self
            .transport
            .reply_photo(record.origin(), placeholder.path(), PREPARING_CAPTION, TextFormat::Plain)
            .await?;
        drop(placeholder);
        *status = Some(message);

        let workflow = self
            .workflow
            .prepare(&spec, &self.settings.models, self.settings.save_images)?;
        let client_id = user_id.to_string();
        let mut events = self.engine.open_events(&client_id).await?;
        let prompt_id = self.engine.submit(&workflow, &client_id).await?;
        tracing::info!(user_id, job_id = record.id(), prompt_id = %prompt_id, seed, "Workflow submitted");

        stages.enter(JobStage::Streaming);
        let end = self
            .stream(record, &workflow, &prompt_id, &mut events, message)
            .await;
        drop(events);
        match end {
            Ok(StreamEnd::Succeeded) => {}
            Ok(StreamEnd::Cancelled) => return Ok(JobOutcome::Cancelled),
            Ok(StreamEnd::Failed) => return Ok(JobOutcome::Failed),
            Err(e) => {
                self.stop_at_engine(record, &prompt_id).await;
                return Err(e);
            }
        }

        stages.enter(JobStage::Fetching);
        tracing::info!(user_id, prompt_id = %prompt_id, "Generation complete");
        reporter
            .edit_caption(message, FETCHING_CAPTION, TextFormat::Plain)
            .await;

        let history = self.engine.fetch_history(&prompt_id).await?;
        let Some(mut image) = find_first_image(&history, &prompt_id) else {
            tracing::error!(user_id, prompt_id = %prompt_id, "Failed to find result image");
            reporter
                .edit_caption(message, NO_IMAGE_CAPTION, TextFormat::Plain)
                .await;
            return Ok(JobOutcome::Failed);
        };
        if image.kind.is_none() {
            let kind = if self.settings.save_images { "output" } else { "temp" };
            image.kind = Some(kind.to_string());
        }
        let bytes = self.engine.fetch_image(&image).await?;
        let result = self.media.write_result(user_id, record.id(), &bytes)?;

        stages.enter(JobStage::Reporting);
        let caption = format!("Final image generated with settings:\n{}", spec.describe());
        reporter
            .edit_media(message, result.path(), &caption, TextFormat::MarkdownV2)
            .await;

        Ok(JobOutcome::Completed)
    }

    /// Run the enhancer and show its result. Returns `None` after
    /// reporting a failure.
    async fn enhance(&self, record: &JobRecord, prompt: &str, kind: &str) -> Option<String> {
        let reporter = self.reporter();
        let waiting = reporter
            .reply_text(record.origin(), WAITING_FOR_ENHANCEMENT, TextFormat::Plain)
            .await;

        let result = match &self.enhancer {
            Some(enhancer) => enhancer.enhance(prompt, kind).await,
            None => Err(EnhanceError::NotConfigured),
        };

        match result {
            Ok(enhanced) => {
                tracing::info!(user_id = record.user_id(), kind, "Received enhanced prompt");
                if let Some(waiting) = waiting {
                    let text = format!(
                        "Enhanced prompt:\n```\n{}\n```",
                        escape_markdown_v2_code(&enhanced)
                    );
                    reporter.edit_text(waiting, &text, TextFormat::MarkdownV2).await;
                }
                Some(enhanced)
            }
            Err(e) => {
                tracing::error!(user_id = record.user_id(), kind, error = %e, "Failed to enhance prompt");
                let text = e.to_string();
                match waiting {
                    Some(waiting) => reporter.edit_text(waiting, &text, TextFormat::Plain).await,
                    None => {
                        reporter.reply_text(record.origin(), &text, TextFormat::Plain).await;
                    }
                }
                None
            }
        }
    }

    /// Interpret engine events for `prompt_id` until a terminal event,
    /// cancellation, or the stream closing.
    async fn stream(
        &self,
        record: &JobRecord,
        workflow: &serde_json::Value,
        prompt_id: &str,
        events: &mut EventStream,
        message: MessageRef,
    ) -> Result<StreamEnd, PipelineError> {
        let reporter = self.reporter();
        let every_n = self.settings.preview_every_n_steps.max(1) as i32;
        let mut caption: Option<String> = None;
        let mut show_preview = false;

        while let Some(event) = events.next().await {
            let event = event?;
            if let StreamEvent::Message(msg) = &event {
                if starts_execution(msg, prompt_id) {
                    record.mark_running();
                }
            }

            if record.is_cancelled() {
                tracing::info!(user_id = record.user_id(), prompt_id, "Generation cancelled");
                self.stop_at_engine(record, prompt_id).await;
                reporter
                    .edit_caption(message, CANCELLED_CAPTION, TextFormat::Plain)
                    .await;
                return Ok(StreamEnd::Cancelled);
            }

            let msg = match event {
                StreamEvent::Message(msg) => msg,
                StreamEvent::Binary(frame) => {
                    if std::mem::take(&mut show_preview) {
                        self.show_preview(record, &frame, caption.as_deref().unwrap_or_default(), message)
                            .await;
                    }
                    continue;
                }
            };

            show_preview = false;
            if msg.prompt_id() != Some(prompt_id) {
                continue;
            }

            let next = match msg {
                ComfyUIMessage::ExecutionStart(_) => continue,
                ComfyUIMessage::Executing(data) => {
                    match data.node {
                        Some(node) => {
                            let title = node_title(workflow, &node).unwrap_or(node.as_str());
                            format!("Executing node {title}...")
                        }
                        None => return Ok(StreamEnd::Succeeded),
                    }
                }
                ComfyUIMessage::Progress(data) => {
                    if (data.value - 1).rem_euclid(every_n) == 0 {
                        show_preview = true;
                    }
                    tracing::debug!(prompt_id, value = data.value, max = data.max, "Generation progress");
                    format!("Progress: {}/{}", data.value, data.max)
                }
                ComfyUIMessage::Executed(data) => format!("Completed node {}", data.node),
                ComfyUIMessage::ExecutionCached(_) => CACHED_CAPTION.to_string(),
                ComfyUIMessage::ExecutionSuccess(_) => return Ok(StreamEnd::Succeeded),
                ComfyUIMessage::ExecutionError(data) => {
                    tracing::warn!(
                        prompt_id,
                        node_id = ?data.node_id,
                        exception_type = %data.exception_type,
                        exception_message = %data.exception_message,
                        "Generation failed",
                    );
                    let text = format!(
                        "Failed to generate image, an error has occured. Try again. (Error type: {}, Error message: {})",
                        data.exception_type, data.exception_message,
                    );
                    let text = truncate_chars(&text, MAX_CAPTION_CHARS - 3);
                    reporter.edit_caption(message, &text, TextFormat::Plain).await;
                    return Ok(StreamEnd::Failed);
                }
                ComfyUIMessage::ExecutionInterrupted(_) => {
                    tracing::info!(prompt_id, "Generation interrupted on the engine");
                    reporter
                        .edit_caption(message, INTERRUPTED_CAPTION, TextFormat::Plain)
                        .await;
                    return Ok(StreamEnd::Cancelled);
                }
                ComfyUIMessage::Status(_) => continue,
            };

            if caption.as_deref() != Some(next.as_str()) {
                reporter.edit_caption(message, &next, TextFormat::Plain).await;
                caption = Some(next);
            }
        }

        Err(PipelineError::EngineProtocol(
            "Event stream closed before the prompt finished".to_string(),
        ))
    }

    async fn show_preview(&self, record: &JobRecord, frame: &[u8], caption: &str, message: MessageRef) {
        let Some(bytes) = preview_image_bytes(frame) else {
            return;
        };
        match self.media.write_preview(record.user_id(), record.id(), bytes) {
            Ok(preview) => {
                tracing::debug!(user_id = record.user_id(), "Updating preview");
                self.reporter()
                    .edit_media(message, preview.path(), caption, TextFormat::Plain)
                    .await;
            }
            Err(e) => {
                tracing::warn!(user_id = record.user_id(), error = %e, "Skipping undecodable preview");
            }
        }
    }

    /// Best-effort removal of our prompt from the engine: interrupt it if
    /// it has started, otherwise delete it from the engine's queue.
    async fn stop_at_engine(&self, record: &JobRecord, prompt_id: &str) {
        let result = if record.is_running() {
            tracing::debug!(prompt_id, "Interrupting running prompt");
            self.engine.interrupt().await
        } else {
            tracing::debug!(prompt_id, "Removing prompt from engine queue");
            self.engine.dequeue(prompt_id).await
        };
        if let Err(e) = result {
            tracing::warn!(prompt_id, error = %e, "Failed to stop prompt on the engine");
        }
    }
}

/// Whether `msg` shows the engine picking up `prompt_id`.
fn starts_execution(msg: &ComfyUIMessage, prompt_id: &str) -> bool {
    matches!(msg, ComfyUIMessage::ExecutionStart(_) | ComfyUIMessage::Executing(_))
        && msg.prompt_id() == Some(prompt_id)
}
