use crate::config::{GenerationSettings, ProviderConfig};
use crate::error::ProviderError;
use crate::llm::{Message, ProviderClient, Role, TextStream};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

const API_KEY_HEADER: &str = "x-goog-api-key";
const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

pub struct GeminiClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
    system_prompt: String,
    generation: GenerationSettings,
}

impl GeminiClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            system_prompt: config.system_prompt.clone(),
            generation: config.generation.clone(),
        }
    }

    fn model_endpoint(&self, model: &str, method: &str) -> String {
        let model = model.trim_start_matches("models/");
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    fn build_request(&self, message: &str, history: &[Message]) -> GenerateContentRequest {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                Content::text(Some(role), &turn.content)
            })
            .collect();
        contents.push(Content::text(Some("user"), message));

        GenerateContentRequest {
            system_instruction: Content::text(None, &self.system_prompt),
            contents,
            generation_config: GenerationConfig {
                temperature: self.generation.temperature,
                top_p: self.generation.top_p,
                top_k: self.generation.top_k,
                max_output_tokens: self.generation.max_output_tokens,
            },
        }
    }

    async fn post(
        &self,
        url: &str,
        body: &GenerateContentRequest,
    ) -> Result<Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        Ok(response)
    }

    /// Model ids (without the `models/` prefix) that accept `generateContent`.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(format!("{}/models", self.base_url))
                .header(API_KEY_HEADER, self.api_key.expose_secret());
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request.send().await.map_err(|e| classify_transport(&e))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &body));
            }

            let page: ListModelsResponse = response.json().await.map_err(|e| {
                ProviderError::unknown(format!("invalid model list: {}", e))
            })?;
            models.extend(page.generate_content_models());

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(models)
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        message: &str,
        history: &[Message],
    ) -> Result<String, ProviderError> {
        let request = self.build_request(message, history);
        let response = self
            .post(&self.model_endpoint(model, "generateContent"), &request)
            .await?;

        let body = response.text().await.map_err(|e| classify_transport(&e))?;
        let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::unknown(format!("invalid response: {}", e)).with_raw(body.clone())
        })?;

        match parsed.chunk_text()? {
            Some(text) => Ok(text),
            None => Err(ProviderError::unknown("no text content in response").with_raw(body)),
        }
    }

    async fn stream(
        &self,
        model: &str,
        message: &str,
        history: &[Message],
    ) -> Result<TextStream, ProviderError> {
        let request = self.build_request(message, history);
        let url = format!("{}?alt=sse", self.model_endpoint(model, "streamGenerateContent"));
        let response = self.post(&url, &request).await?;

        Ok(Box::pin(sse_text_stream(response.bytes_stream())))
    }
}

/// Turns a `text/event-stream` body into text chunks in arrival order.
fn sse_text_stream<S, B>(bytes: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let next = bytes.next().await;
            let finished = next.is_none();
            match next {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| classify_transport(&e))?;
                    buffer.extend_from_slice(chunk.as_ref());
                }
                // Flush a final event that arrived without a trailing newline.
                None if !buffer.is_empty() => buffer.push(b'\n'),
                None => {}
            }

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(payload) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }

                let parsed: GenerateContentResponse = serde_json::from_str(payload).map_err(|e| {
                    ProviderError::unknown(format!("invalid stream chunk: {}", e))
                        .with_raw(payload.to_string())
                })?;
                if let Some(text) = parsed.chunk_text()? {
                    yield text;
                }
            }

            if finished {
                break;
            }
        }
    }
}

pub(crate) fn classify_transport(err: &reqwest::Error) -> ProviderError {
    let message = err.to_string();
    if err.is_timeout() {
        ProviderError::unavailable(format!("request timed out: {}", message))
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ProviderError::unavailable(format!("network error: {}", message))
    } else if err.is_decode() {
        ProviderError::unknown(format!("undecodable response: {}", message))
    } else {
        ProviderError::unknown(message)
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = serde_json::from_str::<ApiErrorResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or_default();

    classify_api_error(Some(status.as_u16()), &detail).with_raw(body.to_string())
}

fn classify_api_error(http_status: Option<u16>, detail: &ApiErrorDetail) -> ProviderError {
    let code = http_status.or(detail.code).unwrap_or_default();
    let rpc_status = detail.status.as_deref().unwrap_or_default();
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| format!("API error ({})", code));
    let lowered = message.to_lowercase();

    if matches!(code, 401 | 403)
        || matches!(rpc_status, "UNAUTHENTICATED" | "PERMISSION_DENIED")
        || detail.has_reason("API_KEY_INVALID")
        || lowered.contains("api key")
    {
        ProviderError::auth(message)
    } else if code == 429 || rpc_status == "RESOURCE_EXHAUSTED" || mentions_rate_limit(&lowered) {
        ProviderError::rate_limited(message)
    } else if matches!(code, 500 | 502 | 503 | 504)
        || matches!(rpc_status, "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "INTERNAL")
    {
        ProviderError::unavailable(message)
    } else {
        ProviderError::unknown(message)
    }
}

fn mentions_rate_limit(lowered: &str) -> bool {
    ["429", "quota", "resource exhausted", "rate limit"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Text of the primary candidate; `None` when the chunk carries no text.
    fn chunk_text(&self) -> Result<Option<String>, ProviderError> {
        if let Some(error) = &self.error {
            return Err(classify_api_error(None, error));
        }

        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
        {
            return Err(ProviderError::content_blocked(format!(
                "prompt blocked ({})",
                reason
            )));
        }

        let Some(candidate) = self.candidates.first() else {
            return Ok(None);
        };

        if let Some(reason) = candidate
            .finish_reason
            .as_deref()
            .filter(|r| BLOCKING_FINISH_REASONS.contains(r))
        {
            return Err(ProviderError::content_blocked(format!(
                "response blocked ({})",
                reason
            )));
        }

        let text = candidate
            .content
            .iter()
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .collect::<String>();

        Ok((!text.is_empty()).then_some(text))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorDetail {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}

impl ApiErrorDetail {
    fn has_reason(&self, reason: &str) -> bool {
        self.details
            .iter()
            .any(|d| d.get("reason").and_then(|r| r.as_str()) == Some(reason))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

impl ListModelsResponse {
    fn generate_content_models(&self) -> impl Iterator<Item = String> + '_ {
        self.models
            .iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| m.name.trim_start_matches("models/").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::ProviderErrorKind;
    use actix_web::{web, App, HttpRequest, HttpResponse};

    fn client_for(base_url: &str) -> GeminiClient {
        let config = AppConfig::from_lookup(|key| match key {
            "GEMINI_API_KEY" => Some("test-key".to_string()),
            "GEMINI_BASE_URL" => Some(base_url.to_string()),
            "SYSTEM_PROMPT" => Some("You are a test persona.".to_string()),
            _ => None,
        })
        .unwrap();
        GeminiClient::new(&config.provider)
    }

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send + 'static {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(c.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_request_includes_persona_and_history_in_order() {
        let client = client_for("http://localhost/v1beta");
        let history = vec![
            Message::user("Who are you?"),
            Message::assistant("A portfolio assistant."),
        ];
        let request = client.build_request("Hello, how are you?", &history);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(
            json["systemInstruction"]["parts"][0]["text"],
            "You are a test persona."
        );
        assert!(json["systemInstruction"].get("role").is_none());

        let contents = json["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "Who are you?");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "Hello, how are you?");

        assert_eq!(json["generationConfig"]["maxOutputTokens"], 400);
        assert_eq!(json["generationConfig"]["topK"], 40);
    }

    #[test]
    fn test_model_endpoint_strips_prefix() {
        let client = client_for("http://localhost/v1beta/");
        assert_eq!(
            client.model_endpoint("models/gemini-1.5-flash", "generateContent"),
            "http://localhost/v1beta/models/gemini-1.5-flash:generateContent"
        );
    }

    #[test]
    fn test_classify_status() {
        let invalid_key = r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT","details":[{"@type":"type.googleapis.com/google.rpc.ErrorInfo","reason":"API_KEY_INVALID"}]}}"#;
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, invalid_key).kind,
            ProviderErrorKind::AuthError
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, "").kind,
            ProviderErrorKind::AuthError
        );

        let quota = r#"{"error":{"code":429,"message":"Resource has been exhausted (e.g. check quota).","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, quota);
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert_eq!(err.message, "Resource has been exhausted (e.g. check quota).");
        assert_eq!(err.raw.as_deref(), Some(quota));

        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "overloaded").kind,
            ProviderErrorKind::Unavailable
        );

        let quota_message = r#"{"error":{"code":400,"message":"Quota exceeded for metric: generate_content_requests","status":"FAILED_PRECONDITION"}}"#;
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, quota_message).kind,
            ProviderErrorKind::RateLimited
        );

        let missing = r#"{"error":{"code":404,"message":"models/gemini-1.0-pro is not found for API version v1beta","status":"NOT_FOUND"}}"#;
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, missing).kind,
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn test_rate_limit_detected_from_message_text() {
        let detail = ApiErrorDetail {
            message: Some("429 Resource exhausted, retry later".to_string()),
            ..ApiErrorDetail::default()
        };
        assert_eq!(
            classify_api_error(None, &detail).kind,
            ProviderErrorKind::RateLimited
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_unavailable() {
        let client = client_for("http://127.0.0.1:1/v1beta");

        let err = client
            .generate("gemini-1.5-flash", "ping", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unavailable);
        assert!(err.message.starts_with("network error"));

        let err = client.stream("gemini-1.5-flash", "ping", &[]).await.err().unwrap();
        assert_eq!(err.kind, ProviderErrorKind::Unavailable);
    }

    #[test]
    fn test_blocked_prompt_and_finish_reason() {
        let blocked: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(
            blocked.chunk_text().unwrap_err().kind,
            ProviderErrorKind::ContentBlocked
        );

        let finished: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[]},"finishReason":"PROHIBITED_CONTENT"}]}"#,
        )
        .unwrap();
        assert_eq!(
            finished.chunk_text().unwrap_err().kind,
            ProviderErrorKind::ContentBlocked
        );

        let normal: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi "},{"text":"there"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(normal.chunk_text().unwrap().as_deref(), Some("Hi there"));
    }

    #[tokio::test]
    async fn test_sse_chunks_in_order_across_splits() {
        let stream = sse_text_stream(byte_stream(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"te",
            "xt\":\"lo \\u00e9\"}]}}]}\r\n\r\n",
            ": keep-alive\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"caf\u{e9}!\"}]},\"finishReason\":\"STOP\"}]}",
        ]));

        let chunks: Vec<_> = stream.collect().await;
        let texts: Vec<String> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(texts, vec!["Hel", "lo é", "café!"]);
    }

    #[tokio::test]
    async fn test_sse_multibyte_split_between_reads() {
        let euro = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"5\u{20ac}\"}]}}]}\n";
        let bytes = euro.as_bytes();
        let split = euro.find('\u{20ac}').unwrap() + 1;
        let first: &'static [u8] = Box::leak(bytes[..split].to_vec().into_boxed_slice());
        let second: &'static [u8] = Box::leak(bytes[split..].to_vec().into_boxed_slice());

        let stream = sse_text_stream(futures::stream::iter(vec![
            Ok::<_, reqwest::Error>(first),
            Ok(second),
        ]));
        let texts: Vec<_> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(texts, vec!["5€"]);
    }

    #[tokio::test]
    async fn test_sse_safety_stop_is_terminal_error() {
        let stream = sse_text_stream(byte_stream(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Sure, \"}]}}]}\n\n",
            "data: {\"candidates\":[{\"finishReason\":\"SAFETY\"}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"never\"}]}}]}\n\n",
        ]));

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "Sure, ");
        assert_eq!(
            items[1].as_ref().unwrap_err().kind,
            ProviderErrorKind::ContentBlocked
        );
    }

    #[tokio::test]
    async fn test_sse_error_payload_is_classified() {
        let stream = sse_text_stream(byte_stream(vec![
            "data: {\"error\":{\"code\":503,\"message\":\"The model is overloaded.\",\"status\":\"UNAVAILABLE\"}}\n\n",
        ]));
        let items: Vec<_> = stream.collect().await;
        let err = items[0].as_ref().unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unavailable);
        assert_eq!(err.message, "The model is overloaded.");
    }

    #[test]
    fn test_list_models_filters_generate_content() {
        let page: ListModelsResponse = serde_json::from_str(
            r#"{"models":[
                {"name":"models/gemini-1.5-flash","supportedGenerationMethods":["generateContent","countTokens"]},
                {"name":"models/text-embedding-004","supportedGenerationMethods":["embedContent"]}
            ]}"#,
        )
        .unwrap();
        let models: Vec<String> = page.generate_content_models().collect();
        assert_eq!(models, vec!["gemini-1.5-flash"]);
        assert!(page.next_page_token.is_none());
    }

    async fn fake_generate(req: HttpRequest, body: web::Json<serde_json::Value>) -> HttpResponse {
        if req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) != Some("test-key") {
            return HttpResponse::Forbidden().finish();
        }
        let model = req.match_info().get("call").unwrap_or_default().to_string();
        if model.starts_with("busy-model") {
            return HttpResponse::TooManyRequests().json(serde_json::json!({
                "error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}
            }));
        }
        let prompt = body["contents"][0]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if model.ends_with(":streamGenerateContent") {
            let frames = ["echo: ", prompt.as_str()]
                .iter()
                .map(|t| {
                    format!(
                        "data: {}\r\n\r\n",
                        serde_json::json!({"candidates":[{"content":{"parts":[{"text": t}]}}]})
                    )
                })
                .collect::<String>();
            return HttpResponse::Ok()
                .content_type("text/event-stream")
                .body(frames);
        }
        HttpResponse::Ok().json(serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": format!("echo: {}", prompt)}]},
                "finishReason": "STOP"
            }]
        }))
    }

    #[actix_rt::test]
    async fn test_round_trip_against_local_server() {
        let srv = actix_test::start(|| {
            App::new().route("/v1beta/models/{call}", web::post().to(fake_generate))
        });
        let client = client_for(&srv.url("/v1beta"));

        let text = client
            .generate("gemini-1.5-flash", "ping", &[])
            .await
            .unwrap();
        assert_eq!(text, "echo: ping");

        let err = client.generate("busy-model", "ping", &[]).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);

        let stream = client.stream("gemini-1.5-flash", "ping", &[]).await.unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["echo: ", "ping"]);
    }
}
