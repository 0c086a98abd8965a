//! The chat transport seam and retrying status reporter.
//!
//! Status edits are retried with exponential backoff (1 s, 2 s, 4 s) on
//! transient network errors, then dropped with a log line. A failed
//! status update never fails the job.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use comfybot_core::types::MessageRef;

/// Retry delays in seconds (exponential backoff: 1s, 2s, 4s).
const RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// How message text or captions should be interpreted by the chat client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    MarkdownV2,
    Html,
}

/// Errors returned by a [`ChatTransport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Network hiccup, timeout or rate limit. Worth retrying.
    #[error("Transient transport error: {0}")]
    Transient(String),

    /// The chat API rejected the request.
    #[error("Chat API error: {0}")]
    Api(String),

    /// A local file could not be read for upload.
    #[error("Failed to read upload {path}: {source}")]
    Upload {
        path: String,
        source: std::io::Error,
    },
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outgoing chat operations the pipeline and command handlers use.
///
/// Replies are threaded to `to`, the message that triggered them.
/// Edits target a message previously returned by a reply.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn reply_text(
        &self,
        to: MessageRef,
        text: &str,
        format: TextFormat,
    ) -> Result<MessageRef, TransportError>;

    async fn reply_photo(
        &self,
        to: MessageRef,
        photo: &Path,
        caption: &str,
        format: TextFormat,
    ) -> Result<MessageRef, TransportError>;

    async fn edit_text(
        &self,
        message: MessageRef,
        text: &str,
        format: TextFormat,
    ) -> Result<(), TransportError>;

    async fn edit_caption(
        &self,
        message: MessageRef,
        caption: &str,
        format: TextFormat,
    ) -> Result<(), TransportError>;

    /// Replace the photo of `message` and set its caption.
    async fn edit_media(
        &self,
        message: MessageRef,
        photo: &Path,
        caption: &str,
        format: TextFormat,
    ) -> Result<(), TransportError>;
}

/// Backoff schedule for transient transport errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RETRY_DELAYS_SECS.iter().map(|s| Duration::from_secs(*s)).collect())
    }
}

impl RetryPolicy {
    /// One retry per entry in `delays`, sleeping that long before it.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Run `op`, retrying while it fails with a transient error.
    ///
    /// Non-transient errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut delays = self.delays.iter();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(attempt, error = %e, "{what} failed, retrying");
                        tokio::time::sleep(*delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Best-effort status updates for one job.
///
/// Every method logs and swallows failures.
pub struct Reporter<'a> {
    transport: &'a dyn ChatTransport,
    retry: &'a RetryPolicy,
}

impl<'a> Reporter<'a> {
    pub fn new(transport: &'a dyn ChatTransport, retry: &'a RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub async fn edit_caption(&self, message: MessageRef, caption: &str, format: TextFormat) {
        let result = self
            .retry
            .run("Caption edit", || {
                self.transport.edit_caption(message, caption, format)
            })
            .await;
        if let Err(e) = result {
            tracing::error!(message_id = message.message_id, error = %e, "Giving up on caption edit");
        }
    }

    pub async fn edit_media(
        &self,
        message: MessageRef,
        photo: &Path,
        caption: &str,
        format: TextFormat,
    ) {
        let result = self
            .retry
            .run("Media edit", || {
                self.transport.edit_media(message, photo, caption, format)
            })
            .await;
        if let Err(e) = result {
            tracing::error!(message_id = message.message_id, error = %e, "Giving up on media edit");
        }
    }

    pub async fn edit_text(&self, message: MessageRef, text: &str, format: TextFormat) {
        if let Err(e) = self.transport.edit_text(message, text, format).await {
            tracing::error!(message_id = message.message_id, error = %e, "Failed to edit message");
        }
    }

    /// Reply to `to`, returning `None` if the message could not be sent.
    pub async fn reply_text(&self, to: MessageRef, text: &str, format: TextFormat) -> Option<MessageRef> {
        match self.transport.reply_text(to, text, format).await {
            Ok(sent) => Some(sent),
            Err(e) => {
                tracing::error!(chat_id = to.chat_id, error = %e, "Failed to send reply");
                None
            }
        }
    }
}
