//! Minimal Telegram Bot API client over [`reqwest`].
//!
//! Only the methods the bot needs: long polling, sending and editing
//! text and photo messages, and registering the command menu.

use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::types::{ApiResponse, BotCommand, Message, Update};

/// Extra time on top of the long-poll timeout before the HTTP request
/// itself is abandoned.
const POLL_GRACE_SECS: u64 = 10;

/// Timeout for every other request (uploads included).
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Errors from the Telegram Bot API layer.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The Bot API answered `ok: false`.
    #[error("Telegram API error ({code:?}): {description}")]
    Api {
        code: Option<u16>,
        description: String,
        retry_after: Option<u64>,
    },

    /// A local file could not be read for upload.
    #[error("Failed to read upload {path}: {source}")]
    Upload {
        path: String,
        source: std::io::Error,
    },

    /// `ok: true` without a `result`.
    #[error("Telegram returned no result for {0}")]
    MissingResult(&'static str),
}

impl TelegramError {
    /// Network failures, flood control and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { code, .. } => matches!(code, Some(429) | Some(500..=599)),
            Self::Upload { .. } | Self::MissingResult(_) => false,
        }
    }

    /// Telegram rejects edits that would not change the message.
    fn is_not_modified(&self) -> bool {
        matches!(self, Self::Api { description, .. } if description.contains("message is not modified"))
    }
}

/// HTTP client bound to one bot token.
pub struct TelegramApi {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramApi {
    /// * `api_url` - Bot API server, normally `https://api.telegram.org`.
    pub fn new(client: reqwest::Client, api_url: &str, token: &str) -> Self {
        Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, TelegramError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        let response = self
            .client
            .post(self.url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs + POLL_GRACE_SECS))
            .json(&body)
            .send()
            .await?;
        Self::parse_response(response, "getUpdates").await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
        parse_mode: Option<&str>,
    ) -> Result<Message, TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(message_id) = reply_to {
            body["reply_parameters"] = reply_parameters(message_id);
        }
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }
        self.call_json("sendMessage", &body).await
    }

    pub async fn send_photo(
        &self,
        chat_id: i64,
        photo: &Path,
        caption: &str,
        reply_to: Option<i64>,
        parse_mode: Option<&str>,
    ) -> Result<Message, TelegramError> {
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", photo_part(photo).await?);
        if let Some(message_id) = reply_to {
            form = form.text("reply_parameters", reply_parameters(message_id).to_string());
        }
        if let Some(mode) = parse_mode {
            form = form.text("parse_mode", mode.to_string());
        }
        self.call_multipart("sendPhoto", form).await
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }
        Self::ignore_not_modified(
            self.call_json::<serde_json::Value>("editMessageText", &body)
                .await,
        )
    }

    pub async fn edit_message_caption(
        &self,
        chat_id: i64,
        message_id: i64,
        caption: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "caption": caption,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }
        Self::ignore_not_modified(
            self.call_json::<serde_json::Value>("editMessageCaption", &body)
                .await,
        )
    }

    /// Replace a photo message's image and caption with an uploaded file.
    pub async fn edit_message_media(
        &self,
        chat_id: i64,
        message_id: i64,
        photo: &Path,
        caption: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut media = json!({
            "type": "photo",
            "media": "attach://photo",
            "caption": caption,
        });
        if let Some(mode) = parse_mode {
            media["parse_mode"] = json!(mode);
        }
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("message_id", message_id.to_string())
            .text("media", media.to_string())
            .part("photo", photo_part(photo).await?);
        Self::ignore_not_modified(
            self.call_multipart::<serde_json::Value>("editMessageMedia", form)
                .await,
        )
    }

    pub async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<(), TelegramError> {
        let body = json!({ "commands": commands });
        self.call_json::<bool>("setMyCommands", &body).await?;
        Ok(())
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: &serde_json::Value,
    ) -> Result<T, TelegramError> {
        let response = self
            .client
            .post(self.url(method))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(body)
            .send()
            .await?;
        Self::parse_response(response, method).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &'static str,
        form: Form,
    ) -> Result<T, TelegramError> {
        let response = self
            .client
            .post(self.url(method))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .multipart(form)
            .send()
            .await?;
        Self::parse_response(response, method).await
    }

    /// Decode the `{ok, result}` envelope. Error statuses still carry
    /// a JSON body with the description, so the status is not checked
    /// separately.
    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
        method: &'static str,
    ) -> Result<T, TelegramError> {
        let status = response.status();
        let envelope: ApiResponse<T> = match response.json().await {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(TelegramError::Api {
                    code: Some(status.as_u16()),
                    description: status.to_string(),
                    retry_after: None,
                })
            }
        };
        if !envelope.ok {
            return Err(TelegramError::Api {
                code: envelope.error_code.or(Some(status.as_u16())),
                description: envelope.description.unwrap_or_default(),
                retry_after: envelope.parameters.and_then(|p| p.retry_after),
            });
        }
        envelope.result.ok_or(TelegramError::MissingResult(method))
    }

    fn ignore_not_modified(result: Result<serde_json::Value, TelegramError>) -> Result<(), TelegramError> {
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_modified() => {
                tracing::debug!("Edit skipped, message not modified");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn reply_parameters(message_id: i64) -> serde_json::Value {
    json!({
        "message_id": message_id,
        "allow_sending_without_reply": true,
    })
}

async fn photo_part(path: &Path) -> Result<Part, TelegramError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| TelegramError::Upload {
        path: path.display().to_string(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "photo".to_string());
    Ok(Part::bytes(bytes).file_name(file_name))
}
