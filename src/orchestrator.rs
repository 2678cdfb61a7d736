use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::Instrument;

use crate::config::ChatConfig;
use crate::error::{ChatError, ProviderError, ProviderErrorKind};
use crate::history::ConversationHistory;
use crate::llm::{CandidateList, ModelCandidate, ProviderClient, TextStream};

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub history: ConversationHistory,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, history: ConversationHistory) -> Self {
        Self {
            message: message.into(),
            history,
        }
    }

    fn validate(&self) -> Result<(), ChatError> {
        if self.message.trim().is_empty() {
            return Err(ChatError::BadInput("message must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResult {
    pub text: String,
    pub model_used: String,
}

/// An open token stream. Not restartable: a new request starts from the first candidate.
pub struct ChatStream {
    pub model_used: String,
    pub chunks: TextStream,
}

/// Recoverable failures seen during one run.
#[derive(Debug, Default)]
struct Failures {
    last: Option<ProviderError>,
    cause: Option<ProviderErrorKind>,
}

impl Failures {
    fn record(&mut self, err: ProviderError) {
        self.cause = Some(match self.cause {
            Some(cause) => cause.most_specific(err.kind),
            None => err.kind,
        });
        self.last = Some(err);
    }
}

/// Runs one conversation turn against the candidate models in priority order.
#[derive(Clone)]
pub struct ChatOrchestrator {
    client: Arc<dyn ProviderClient>,
    candidates: CandidateList,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
    max_history_turns: usize,
}

impl ChatOrchestrator {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        candidates: CandidateList,
        config: &ChatConfig,
    ) -> Self {
        Self {
            client,
            candidates,
            request_timeout: config.request_timeout(),
            stream_idle_timeout: config.stream_idle_timeout(),
            max_history_turns: config.max_history_turns,
        }
    }

    pub fn candidates(&self) -> &CandidateList {
        &self.candidates
    }

    pub async fn converse(&self, request: ChatRequest) -> Result<ChatResult, ChatError> {
        request.validate()?;
        let history = request.history.bounded(self.max_history_turns);
        let span = tracing::info_span!(
            "converse",
            request_id = %uuid::Uuid::new_v4(),
            streaming = false
        );

        self.generate_with_fallback(&request.message, &history)
            .instrument(span)
            .await
    }

    /// Opens a token stream on the first candidate that accepts it.
    ///
    /// Fallback only happens while opening; once chunks flow, a provider failure
    /// ends the stream with an error item.
    pub async fn converse_stream(&self, request: ChatRequest) -> Result<ChatStream, ChatError> {
        request.validate()?;
        let history = request.history.bounded(self.max_history_turns);
        let span = tracing::info_span!(
            "converse",
            request_id = %uuid::Uuid::new_v4(),
            streaming = true
        );

        self.open_with_fallback(&request.message, &history)
            .instrument(span)
            .await
    }

    async fn generate_with_fallback(
        &self,
        message: &str,
        history: &ConversationHistory,
    ) -> Result<ChatResult, ChatError> {
        let mut failures = Failures::default();

        for candidate in self.candidates.iter() {
            tracing::info!(model = %candidate.identifier, "attempting model");

            let attempt = timeout(
                self.request_timeout,
                self.client.generate(&candidate.identifier, message, history.turns()),
            )
            .await
            .unwrap_or_else(|_| Err(self.timed_out(candidate)));

            match attempt {
                Ok(text) => {
                    tracing::info!(model = %candidate.identifier, "model responded");
                    return Ok(ChatResult {
                        text,
                        model_used: candidate.identifier.clone(),
                    });
                }
                Err(err) => failures.record(self.fall_back(candidate, err)?),
            }
        }

        Err(self.exhausted(failures))
    }

    async fn open_with_fallback(
        &self,
        message: &str,
        history: &ConversationHistory,
    ) -> Result<ChatStream, ChatError> {
        let mut failures = Failures::default();

        for candidate in self.candidates.iter() {
            tracing::info!(model = %candidate.identifier, "opening stream");

            let opened = timeout(
                self.request_timeout,
                self.client.stream(&candidate.identifier, message, history.turns()),
            )
            .await
            .unwrap_or_else(|_| Err(self.timed_out(candidate)));

            match opened {
                Ok(chunks) => {
                    tracing::info!(model = %candidate.identifier, "stream opened");
                    return Ok(ChatStream {
                        model_used: candidate.identifier.clone(),
                        chunks: guard_stream(
                            candidate.identifier.clone(),
                            chunks,
                            self.stream_idle_timeout,
                        ),
                    });
                }
                Err(err) => failures.record(self.fall_back(candidate, err)?),
            }
        }

        Err(self.exhausted(failures))
    }

    /// Returns the error to remember when fallback may continue, or the
    /// request-fatal error to surface.
    fn fall_back(
        &self,
        candidate: &ModelCandidate,
        err: ProviderError,
    ) -> Result<ProviderError, ChatError> {
        if err.kind.is_request_fatal() {
            tracing::error!(
                model = %candidate.identifier,
                kind = ?err.kind,
                raw = err.raw.as_deref().unwrap_or_default(),
                "model failed, not trying other candidates: {}",
                err.message
            );
            return Err(ChatError::Provider(err));
        }

        tracing::warn!(
            model = %candidate.identifier,
            kind = ?err.kind,
            raw = err.raw.as_deref().unwrap_or_default(),
            "model failed, switching to next candidate: {}",
            err.message
        );
        Ok(err)
    }

    fn timed_out(&self, candidate: &ModelCandidate) -> ProviderError {
        ProviderError::unavailable(format!(
            "{} did not respond within {}s",
            candidate.identifier,
            self.request_timeout.as_secs()
        ))
    }

    fn exhausted(&self, failures: Failures) -> ChatError {
        let last = failures
            .last
            .unwrap_or_else(|| ProviderError::unknown("no model candidates configured"));
        let cause = failures.cause.unwrap_or(last.kind);
        tracing::error!(
            candidates = self.candidates.len(),
            cause = ?cause,
            "all model candidates failed: {}",
            last
        );
        ChatError::AllCandidatesExhausted { last, cause }
    }
}

/// Bounds each chunk wait and stops after the first error.
fn guard_stream(model: String, chunks: TextStream, idle: Duration) -> TextStream {
    Box::pin(async_stream::stream! {
        let mut chunks = Box::pin(tokio_stream::StreamExt::timeout(chunks, idle));

        while let Some(item) = chunks.next().await {
            match item {
                Ok(Ok(text)) => yield Ok(text),
                Ok(Err(err)) => {
                    tracing::warn!(
                        model = %model,
                        kind = ?err.kind,
                        "stream failed: {}",
                        err.message
                    );
                    yield Err(err);
                    break;
                }
                Err(_) => {
                    tracing::warn!(model = %model, "stream stalled");
                    yield Err(ProviderError::unavailable(format!(
                        "{} produced no output for {}s",
                        model,
                        idle.as_secs()
                    )));
                    break;
                }
            }
        }
    })
}
