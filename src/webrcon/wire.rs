use serde::{Deserialize, Serialize};

/// Identifier below which a response is an unsolicited stream message rather
/// than an answer to one of our commands.
pub const CALLBACK_ID_FLOOR: i32 = 1000;

/// Identifier for fire-and-forget commands. The server sends no response.
pub const FIRE_AND_FORGET_ID: i32 = -1;

/// Name the server expects on every command frame.
pub const COMMAND_NAME: &str = "WebRcon";

/// Outbound command frame. Field names are fixed by the wire protocol and
/// capitalized, so everything is renamed explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    #[serde(rename = "Identifier")]
    pub identifier: i32,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Name")]
    pub name: String,
}

impl Command {
    pub fn new(identifier: i32, message: &str) -> Self {
        Self {
            identifier,
            message: message.to_string(),
            name: COMMAND_NAME.to_string(),
        }
    }
}

/// Inbound response frame. Missing fields default so partial frames still
/// decode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    #[serde(rename = "Identifier", default)]
    pub identifier: i32,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Type", default)]
    pub message_type: String,
    #[serde(rename = "Stacktrace", default)]
    pub stacktrace: String,
}

impl Response {
    /// True when this frame answers a command we issued with a callback.
    pub fn is_correlated(&self) -> bool {
        self.identifier >= CALLBACK_ID_FLOOR
    }

    /// Decodes the chat payload carried in `Message` when `Type` is "Chat".
    /// Returns None for any other type or on a malformed payload.
    pub fn chat(&self) -> Option<ChatMessage> {
        if self.message_type != "Chat" {
            return None;
        }
        serde_json::from_str(&self.message).ok()
    }
}

/// Chat message format nested as JSON inside `Response.Message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(rename = "Channel", default)]
    pub channel: i32,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "UserId", default)]
    pub user_id: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Color", default)]
    pub color: String,
    #[serde(rename = "Time", default)]
    pub time: i64,
}
