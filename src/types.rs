use serde::{Deserialize, Serialize};

use crate::history::ConversationHistory;
use crate::llm::Message;

pub const SERVICE_NAME: &str = "Portfolio AI Chatbot API";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message: String,
    pub status: String,
}

/// Body of `POST /chat`: a single turn with no history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleChatRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleChatResponse {
    pub response: String,
    pub model: String,
}

/// Body of `POST /api/chat` and `POST /api/chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequestBody {
    pub message: String,
    /// Absent and `null` both mean no prior turns.
    #[serde(default)]
    pub conversation_history: Option<Vec<Message>>,
}

impl ChatRequestBody {
    pub fn into_parts(self) -> (String, ConversationHistory) {
        let history = ConversationHistory::new(self.conversation_history.unwrap_or_default());
        (self.message, history)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    /// RFC 3339 / ISO-8601, UTC.
    pub timestamp: String,
}

/// Payload of an `error` SSE event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorEvent {
    pub error: String,
    pub code: String,
}
