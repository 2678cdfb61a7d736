use actix_web::{web, Responder};
use actix_web_lab::sse::{self, Event, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;

use crate::error::ApiError;
use crate::history::ConversationHistory;
use crate::orchestrator::{ChatOrchestrator, ChatRequest, ChatStream};
use crate::types::{
    ChatRequestBody, ChatResponse, HealthResponse, SimpleChatRequest, SimpleChatResponse,
    StatusResponse, StreamErrorEvent, SERVICE_NAME,
};

/// Matches actix's own JSON default; long histories are trimmed by turn count, not rejected.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub async fn root() -> impl Responder {
    web::Json(StatusResponse {
        message: SERVICE_NAME.to_string(),
        status: "running".to_string(),
    })
}

pub async fn health() -> impl Responder {
    web::Json(HealthResponse::ok())
}

pub async fn chat(
    body: web::Json<SimpleChatRequest>,
    orchestrator: web::Data<ChatOrchestrator>,
) -> Result<impl Responder, ApiError> {
    let request = ChatRequest::new(body.into_inner().message, ConversationHistory::default());
    let result = orchestrator.converse(request).await?;

    Ok(web::Json(SimpleChatResponse {
        response: result.text,
        model: result.model_used,
    }))
}

pub async fn chat_with_history(
    body: web::Json<ChatRequestBody>,
    orchestrator: web::Data<ChatOrchestrator>,
) -> Result<impl Responder, ApiError> {
    let (message, history) = body.into_inner().into_parts();
    tracing::info!(history_turns = history.len(), "chat request received");

    let result = orchestrator.converse(ChatRequest::new(message, history)).await?;

    Ok(web::Json(ChatResponse {
        response: result.text,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn chat_stream(
    body: web::Json<ChatRequestBody>,
    orchestrator: web::Data<ChatOrchestrator>,
) -> Result<impl Responder, ApiError> {
    let (message, history) = body.into_inner().into_parts();
    tracing::info!(history_turns = history.len(), "stream request received");

    // Failures before the stream opens are plain JSON errors, not SSE.
    let chat = orchestrator.converse_stream(ChatRequest::new(message, history)).await?;

    Ok(Sse::from_stream(sse_events(chat))
        .with_keep_alive(Duration::from_secs(15))
        .customize()
        .insert_header(("Cache-Control", "no-cache")))
}

/// Chunk events in provider order, then `done`; or an `error` event and nothing after it.
fn sse_events(chat: ChatStream) -> impl Stream<Item = Result<Event, Infallible>> {
    let ChatStream {
        model_used,
        mut chunks,
    } = chat;

    async_stream::stream! {
        let mut delivered = 0usize;
        let mut failed = false;

        while let Some(item) = chunks.next().await {
            match item {
                Ok(text) => {
                    delivered += 1;
                    let data = serde_json::to_string(&text).unwrap_or_default();
                    yield Ok(Event::Data(sse::Data::new(data)));
                }
                Err(err) => {
                    let api_error = ApiError::from(err);
                    tracing::warn!(
                        model = %model_used,
                        delivered,
                        "stream ended with error: {}",
                        api_error
                    );
                    let payload = StreamErrorEvent {
                        error: api_error.to_string(),
                        code: api_error.code().to_string(),
                    };
                    let data = serde_json::to_string(&payload).unwrap_or_default();
                    yield Ok(Event::Data(sse::Data::new(data).event("error")));
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            tracing::info!(model = %model_used, delivered, "stream completed");
            yield Ok(Event::Data(sse::Data::new("[DONE]").event("done")));
        }
    }
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(MAX_BODY_BYTES)
        .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .route("/", web::get().to(root))
        .route("/health", web::get().to(health))
        .route("/chat", web::post().to(chat))
        .service(
            web::scope("/api")
                .route("/chat", web::post().to(chat_with_history))
                .route("/chat/stream", web::post().to(chat_stream)),
        );
}
