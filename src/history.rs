use crate::llm::Message;
use serde::{Deserialize, Serialize};

/// Prior turns of one conversation, oldest first. Lives only for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory(Vec<Message>);

impl ConversationHistory {
    pub fn new(turns: Vec<Message>) -> Self {
        Self(turns)
    }

    /// Keeps the most recent `max_turns` turns, dropping from the oldest end.
    pub fn bounded(mut self, max_turns: usize) -> Self {
        if self.0.len() > max_turns {
            let excess = self.0.len() - max_turns;
            tracing::debug!(dropped = excess, "trimming conversation history");
            self.0.drain(..excess);
        }
        self
    }

    pub fn turns(&self) -> &[Message] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<Message>> for ConversationHistory {
    fn from(turns: Vec<Message>) -> Self {
        Self(turns)
    }
}
