pub mod gemini;

use crate::error::ProviderError;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

/// Lazy, finite sequence of text chunks. An `Err` item is terminal.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Uniform call surface over a remote generative model.
///
/// Implementations apply the system instruction themselves and must translate
/// every failure into a [`ProviderError`].
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        message: &str,
        history: &[Message],
    ) -> Result<String, ProviderError>;

    /// Returns once the provider has accepted the stream. Dropping the returned
    /// stream releases the underlying connection.
    async fn stream(
        &self,
        model: &str,
        message: &str,
        history: &[Message],
    ) -> Result<TextStream, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[cfg(test)]
impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub identifier: String,
    /// Lower is tried first.
    pub priority: u32,
}

/// Immutable, priority-ordered set of models shared by every request.
#[derive(Debug, Clone)]
pub struct CandidateList {
    candidates: Arc<[ModelCandidate]>,
}

impl CandidateList {
    pub fn new(mut candidates: Vec<ModelCandidate>) -> Self {
        candidates.sort_by_key(|c| c.priority);
        Self {
            candidates: candidates.into(),
        }
    }

    /// Builds a list where position in `identifiers` is the priority.
    pub fn from_identifiers<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let candidates = identifiers
            .into_iter()
            .enumerate()
            .map(|(index, identifier)| ModelCandidate {
                identifier: identifier.into(),
                priority: index as u32,
            })
            .collect();
        Self::new(candidates)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelCandidate> {
        self.candidates.iter()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.identifier.as_str()).collect()
    }

    /// Candidates that do not appear in `served`.
    pub fn missing_from(&self, served: &[String]) -> Vec<&str> {
        self.iter()
            .map(|c| c.identifier.as_str())
            .filter(|id| !served.iter().any(|m| m == id))
            .collect()
    }
}
