/// Chat-platform user identifier. Also used as the engine client id.
pub type UserId = i64;

/// Chat-platform chat identifier.
pub type ChatId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Address of a single message on the chat platform.
///
/// Used both as the origin of a request (so replies land in the same
/// chat) and as the handle of a status message that gets edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i64,
}

impl MessageRef {
    pub fn new(chat_id: ChatId, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}
