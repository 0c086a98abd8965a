//! Long-polling update loop.

use std::time::Duration;

use comfybot_core::types::MessageRef;
use tokio_util::sync::CancellationToken;

use crate::handlers::{Bot, IncomingMessage};
use crate::telegram::types::Update;
use crate::telegram::{TelegramApi, TelegramError};

/// Pause after a failed `getUpdates` before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Turn an update into a handler input. Non-text updates are dropped.
pub fn incoming_message(update: &Update) -> Option<IncomingMessage> {
    let message = update.message.as_ref()?;
    let text = message.text.as_ref()?;
    let user_id = message.from.as_ref().map_or(message.chat.id, |user| user.id);
    Some(IncomingMessage {
        user_id,
        origin: MessageRef::new(message.chat.id, message.message_id),
        text: text.clone(),
    })
}

/// Poll until `cancel` fires. Updates are handled in order; generation
/// itself runs on the bot's queue workers.
pub async fn run(api: &TelegramApi, bot: &Bot, timeout_secs: u64, cancel: CancellationToken) {
    let mut offset = 0;
    tracing::info!("Started telegram bot");

    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = api.get_updates(offset, timeout_secs) => result,
        };

        let updates = match result {
            Ok(updates) => updates,
            Err(e) => {
                let delay = retry_delay(&e);
                tracing::warn!(error = %e, delay_secs = delay.as_secs(), "Failed to fetch updates");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = incoming_message(&update) else {
                tracing::trace!(update_id = update.update_id, "Ignoring non-text update");
                continue;
            };
            bot.handle(message).await;
        }
    }

    tracing::info!("Update polling stopped");
}

fn retry_delay(error: &TelegramError) -> Duration {
    match error {
        TelegramError::Api {
            retry_after: Some(secs),
            ..
        } => Duration::from_secs(*secs),
        _ => ERROR_BACKOFF,
    }
}
