//! Chat command handlers.
//!
//! Every incoming text message is either a command (`/start`, `/help`,
//! `/cancel`, `/cancelall`, `/status`) or a generation request. Requests
//! are parsed, enqueued, and the user's queue worker is started when the
//! queue was previously empty.

use std::sync::Arc;

use comfybot_core::job::JobRecord;
use comfybot_core::markup::{escape_html, truncate_chars};
use comfybot_core::modes::ModeRegistry;
use comfybot_core::params;
use comfybot_core::queue::UserQueueManager;
use comfybot_core::types::{MessageRef, UserId};
use comfybot_pipeline::pipeline::GenerationPipeline;
use comfybot_pipeline::transport::{ChatTransport, TextFormat};
use comfybot_pipeline::worker::process_user_queue;
use tokio_util::task::TaskTracker;

use crate::telegram::types::BotCommand;

pub const START_TEXT: &str = "Hi! Send me a prompt and I'll generate an image using ComfyUI. \
You can queue multiple requests. For more information run /help";
pub const CANCELLING_TEXT: &str = "Cancelling the current image generation...";
pub const NOTHING_TO_CANCEL_TEXT: &str = "No active image generation to cancel.";
pub const CANCELLED_ALL_TEXT: &str = "Cancelled all image generations!";
pub const NO_QUEUE_TEXT: &str = "You don't have any tasks in your queue.";
pub const EMPTY_QUEUE_TEXT: &str = "Your queue is currently empty.";
pub const UNKNOWN_COMMAND_TEXT: &str =
    "Unknown command. Available commands are /start, /cancel, and /status.";

/// Longest prompt prefix shown per record in `/status`.
const STATUS_PROMPT_CHARS: usize = 50;

/// A text message from a user.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user_id: UserId,
    pub origin: MessageRef,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Cancel,
    CancelAll,
    Status,
    Unknown(String),
    Prompt(String),
}

impl Command {
    /// Classify a message. Commands may carry a `@botname` suffix.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let Some(rest) = text.strip_prefix('/') else {
            return Self::Prompt(text.to_string());
        };
        let word = rest.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default();
        match name {
            "start" => Self::Start,
            "help" => Self::Help,
            "cancel" => Self::Cancel,
            "cancelall" => Self::CancelAll,
            "status" => Self::Status,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// The command menu registered with `setMyCommands`.
pub fn bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("help", "Show help message"),
        BotCommand::new("cancel", "Cancel current generation"),
        BotCommand::new("cancelall", "Cancel all generations in queue"),
        BotCommand::new("status", "Check queue status"),
    ]
}

/// Shared state of the command handlers.
pub struct Bot {
    queues: Arc<UserQueueManager>,
    pipeline: Arc<GenerationPipeline>,
    transport: Arc<dyn ChatTransport>,
    modes: ModeRegistry,
    help: String,
    workers: TaskTracker,
}

impl Bot {
    pub fn new(
        queues: Arc<UserQueueManager>,
        pipeline: Arc<GenerationPipeline>,
        transport: Arc<dyn ChatTransport>,
        modes: ModeRegistry,
        enhance_types: &[(String, String)],
    ) -> Self {
        let help = help_text(&modes, enhance_types);
        Self {
            queues,
            pipeline,
            transport,
            modes,
            help,
            workers: TaskTracker::new(),
        }
    }

    pub fn queues(&self) -> &Arc<UserQueueManager> {
        &self.queues
    }

    /// Queue worker tasks spawned so far.
    pub fn workers(&self) -> &TaskTracker {
        &self.workers
    }

    pub async fn handle(&self, message: IncomingMessage) {
        let user_id = message.user_id;
        match Command::parse(&message.text) {
            Command::Start => self.reply(message.origin, START_TEXT, TextFormat::Plain).await,
            Command::Help => self.reply(message.origin, &self.help, TextFormat::Html).await,
            Command::Cancel => {
                let text = if self.queues.cancel_current(user_id).await {
                    CANCELLING_TEXT
                } else {
                    NOTHING_TO_CANCEL_TEXT
                };
                self.reply(message.origin, text, TextFormat::Plain).await;
            }
            Command::CancelAll => {
                let text = if self.queues.cancel_all(user_id).await {
                    CANCELLED_ALL_TEXT
                } else {
                    NOTHING_TO_CANCEL_TEXT
                };
                self.reply(message.origin, text, TextFormat::Plain).await;
            }
            Command::Status => {
                let text = if self.queues.has_queue(user_id).await {
                    status_text(&self.queues.status(user_id).await)
                } else {
                    NO_QUEUE_TEXT.to_string()
                };
                self.reply(message.origin, &text, TextFormat::Plain).await;
            }
            Command::Unknown(name) => {
                tracing::debug!(user_id, command = %name, "Unknown command");
                self.reply(message.origin, UNKNOWN_COMMAND_TEXT, TextFormat::Plain)
                    .await;
            }
            Command::Prompt(text) => self.enqueue(user_id, message.origin, &text).await,
        }
    }

    async fn enqueue(&self, user_id: UserId, origin: MessageRef, text: &str) {
        let spec = match params::parse(user_id, text, &self.modes) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::info!(user_id, error = %e, "Invalid generation parameters");
                let reply = format!("Invalid generation parameters: {e}");
                self.reply(origin, &reply, TextFormat::Plain).await;
                return;
            }
        };
        tracing::info!(user_id, prompt = %spec.prompt, batch_size = spec.batch_size, "Parsed generation request");

        let batch_size = spec.batch_size;
        let enqueued = self.queues.enqueue(user_id, spec, origin).await;
        let reply = format!(
            "Your request has been queued. {batch_size} image(s) added to the queue. Total tasks in queue: {}",
            enqueued.queue_len
        );
        self.reply(origin, &reply, TextFormat::Plain).await;

        if enqueued.start_worker {
            self.workers.spawn(process_user_queue(
                Arc::clone(&self.queues),
                Arc::clone(&self.pipeline),
                user_id,
            ));
        }
    }

    async fn reply(&self, to: MessageRef, text: &str, format: TextFormat) {
        if let Err(e) = self.transport.reply_text(to, text, format).await {
            tracing::warn!(chat_id = to.chat_id, error = %e, "Failed to send reply");
        }
    }
}

/// `/status` listing for a user's queue, head first.
pub fn status_text(records: &[Arc<JobRecord>]) -> String {
    let Some(head) = records.first() else {
        return EMPTY_QUEUE_TEXT.to_string();
    };

    let mut text = format!("You have {} task(s) in your queue:\n\n", records.len());
    for (i, record) in records.iter().enumerate() {
        let spec = record.spec();
        let status = if record.is_running() { "Running" } else { "Pending" };
        text.push_str(&format!(
            "{}. Status: {status}\n   Prompt: {}\n   Dimensions: {}x{}\n\n",
            i + 1,
            truncate_chars(&spec.prompt, STATUS_PROMPT_CHARS),
            spec.width,
            spec.height,
        ));
    }
    if head.is_running() {
        text.push_str("The first task in your queue is currently being processed.");
    } else {
        text.push_str("Your tasks are queued and will be processed in order.");
    }
    text
}

/// HTML help: commands, tags, modes and enhancement types.
pub fn help_text(modes: &ModeRegistry, enhance_types: &[(String, String)]) -> String {
    let modes_text = modes
        .all()
        .into_iter()
        .map(|(name, mode)| {
            let mut desc = format!("      <code>m={}</code>", escape_html(&name));
            if let Some(description) = &mode.description {
                desc.push_str(&format!(": {}", escape_html(description)));
            }
            let mut params = vec![format!("cfg={}", mode.cfg), format!("steps={}", mode.steps)];
            if let Some(lora) = &mode.lora {
                params.push(format!("lora={}", escape_html(lora)));
                params.push(format!("lora_strength={}", mode.lora_strength));
            }
            params.push(format!("sampler={}", escape_html(&mode.sampler)));
            params.push(format!("scheduler={}", escape_html(&mode.scheduler)));
            for param in params {
                desc.push_str("\n          ");
                desc.push_str(&param);
            }
            desc
        })
        .collect::<Vec<_>>()
        .join("\n");

    let pe_text = if enhance_types.is_empty() {
        "      (not configured)".to_string()
    } else {
        enhance_types
            .iter()
            .map(|(name, description)| {
                format!("      <code>pe={}</code>: {}", escape_html(name), escape_html(description))
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Available commands:
/start - Display the welcome message
/help - Show this help message
/cancel - Cancel the current image generation
/cancelall - Cancel all generations in queue
/status - Check your queue status

To generate an image, simply send a text message with your prompt.
You can add parameters at the end of your prompt.

<u>Full list of parameters</u>:
<b>Resolution</b>: <code>1920x1080</code>
<b>Aspect ratio</b>: <code>16:9</code>
<b>Megapixel size</b>: <code>4MP</code> (gets overwritten by resolution)
<b>Batch size</b>: <code>3x</code>
<b>Modes</b>:
{modes_text}
<b>Guidance</b>: <code>cfg=3.5</code>
    1-2 for paintings
    1.5-2.5 realistic
    3.5 balanced (default)
    4 flat colors/cartoon
<b>Steps</b>: <code>s=20</code>
<b>Seed</b>: <code>seed=123456789</code> (random by default)
<b>Prompt enhancement</b>:
{pe_text}

<u>Usage example</u>:
\"Create a landscape with mountains <code>1920x1080 2x</code>\"
\"A man in a red t-shirt <code>2MP pe=default m=real</code>\""
    )
}
