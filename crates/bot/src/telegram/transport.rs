//! [`ChatTransport`] over the Telegram Bot API.

use std::path::Path;

use async_trait::async_trait;
use comfybot_core::types::MessageRef;
use comfybot_pipeline::transport::{ChatTransport, TextFormat, TransportError};

use super::api::{TelegramApi, TelegramError};

pub struct TelegramTransport {
    api: TelegramApi,
}

impl TelegramTransport {
    pub fn new(api: TelegramApi) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &TelegramApi {
        &self.api
    }
}

fn parse_mode(format: TextFormat) -> Option<&'static str> {
    match format {
        TextFormat::Plain => None,
        TextFormat::MarkdownV2 => Some("MarkdownV2"),
        TextFormat::Html => Some("HTML"),
    }
}

impl From<TelegramError> for TransportError {
    fn from(e: TelegramError) -> Self {
        match e {
            TelegramError::Upload { path, source } => TransportError::Upload { path, source },
            e if e.is_transient() => TransportError::Transient(e.to_string()),
            e => TransportError::Api(e.to_string()),
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn reply_text(
        &self,
        to: MessageRef,
        text: &str,
        format: TextFormat,
    ) -> Result<MessageRef, TransportError> {
        let sent = self
            .api
            .send_message(to.chat_id, text, Some(to.message_id), parse_mode(format))
            .await?;
        Ok(MessageRef::new(sent.chat.id, sent.message_id))
    }

    async fn reply_photo(
        &self,
        to: MessageRef,
        photo: &Path,
        caption: &str,
        format: TextFormat,
    ) -> Result<MessageRef, TransportError> {
        let sent = self
            .api
            .send_photo(to.chat_id, photo, caption, Some(to.message_id), parse_mode(format))
            .await?;
        Ok(MessageRef::new(sent.chat.id, sent.message_id))
    }

    async fn edit_text(
        &self,
        message: MessageRef,
        text: &str,
        format: TextFormat,
    ) -> Result<(), TransportError> {
        self.api
            .edit_message_text(message.chat_id, message.message_id, text, parse_mode(format))
            .await?;
        Ok(())
    }

    async fn edit_caption(
        &self,
        message: MessageRef,
        caption: &str,
        format: TextFormat,
    ) -> Result<(), TransportError> {
        self.api
            .edit_message_caption(message.chat_id, message.message_id, caption, parse_mode(format))
            .await?;
        Ok(())
    }

    async fn edit_media(
        &self,
        message: MessageRef,
        photo: &Path,
        caption: &str,
        format: TextFormat,
    ) -> Result<(), TransportError> {
        self.api
            .edit_message_media(message.chat_id, message.message_id, photo, caption, parse_mode(format))
            .await?;
        Ok(())
    }
}
