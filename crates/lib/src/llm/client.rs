//! Client for an OpenAI-compatible API: /v1/chat/completions and /v1/images/generations.
//!
//! Streaming requests run on a spawned task that feeds a [`ChatStream`]; the cancellation
//! handle is available as soon as `send_streaming` returns, before any byte is read.

use super::decoder::SseDecoder;
use super::error::ChatError;
use super::stream::{ChatStream, EventSink, STREAM_CHANNEL_CAPACITY};
use crate::session::{Message, ModelConfig};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const CHAT_PATH: &str = "v1/chat/completions";
const IMAGE_PATH: &str = "v1/images/generations";

/// Time allowed until response headers arrive.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Time allowed between two body reads of a streamed reply.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the completion API. Cheap to clone.
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    bearer: Option<String>,
    request_timeout: Duration,
    idle_timeout: Duration,
    client: reqwest::Client,
}

impl ChatClient {
    /// `bearer` is the token sent as `Authorization: Bearer <token>`, if any.
    pub fn new(base_url: Option<String>, bearer: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            bearer,
            request_timeout: REQUEST_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    /// Override the header and idle timeouts (defaults: 60 s each).
    pub fn with_timeouts(mut self, request: Duration, idle: Duration) -> Self {
        self.request_timeout = request;
        self.idle_timeout = idle;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL for an API path. A base that already ends in /v1 is not doubled.
    fn endpoint(&self, path: &str) -> String {
        match path.strip_prefix("v1/") {
            Some(rest) if self.base_url.ends_with("/v1") => format!("{}/{}", self.base_url, rest),
            _ => format!("{}/{}", self.base_url, path),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(self.endpoint(path));
        match &self.bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// POST /v1/chat/completions with stream: true. Events arrive on the returned stream;
    /// cancel it through [`ChatStream::cancel_token`].
    pub fn send_streaming(&self, messages: &[Message], config: &ModelConfig) -> ChatStream {
        let body = ChatRequest::new(messages, config, true);
        log::debug!(
            "stream: POST {} model={} messages={}",
            self.endpoint(CHAT_PATH),
            body.model,
            body.messages.len()
        );
        let request = self.post(CHAT_PATH).json(&body);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let token = cancel.clone();
        let timeouts = (self.request_timeout, self.idle_timeout);
        tokio::spawn(async move {
            let mut sink = EventSink::new(tx);
            if let Err(e) = run_stream(request, &mut sink, &token, timeouts).await {
                if e.is_aborted() {
                    log::debug!("stream: aborted");
                } else {
                    log::warn!("stream: {}", e);
                }
                sink.fail(e).await;
            }
        });
        ChatStream::new(rx, cancel)
    }

    /// POST /v1/chat/completions with stream: false.
    pub async fn chat(
        &self,
        messages: &[Message],
        config: &ModelConfig,
    ) -> Result<ChatResponse, ChatError> {
        self.chat_with_cancel(messages, config, &CancellationToken::new())
            .await
    }

    /// Non-streaming chat that can be aborted through `cancel`.
    pub async fn chat_with_cancel(
        &self,
        messages: &[Message],
        config: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ChatError> {
        let body = ChatRequest::new(messages, config, false);
        let request = self.post(CHAT_PATH).json(&body);
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Aborted),
            res = self.fetch_text(request) => res?,
        };
        let raw: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| ChatError::Parse(e.to_string()))?;
        Ok(ChatResponse { raw })
    }

    /// POST /v1/images/generations.
    pub async fn generate_image(&self, request: &ImageRequest) -> Result<Vec<ImageData>, ChatError> {
        log::debug!("image: POST {} size={}", self.endpoint(IMAGE_PATH), request.size);
        let text = self.fetch_text(self.post(IMAGE_PATH).json(request)).await?;
        let data: ImageResponse =
            serde_json::from_str(&text).map_err(|e| ChatError::Parse(e.to_string()))?;
        Ok(data.data)
    }

    async fn fetch_text(&self, request: reqwest::RequestBuilder) -> Result<String, ChatError> {
        let res = tokio::time::timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| ChatError::Timeout)??;
        let res = check_status(res).await?;
        Ok(res.text().await?)
    }
}

/// Map 401 and other non-success statuses to errors.
async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = res.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ChatError::Unauthorized);
    }
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(ChatError::Stream {
            status: status.as_u16(),
            body,
        });
    }
    Ok(res)
}

async fn run_stream(
    request: reqwest::RequestBuilder,
    sink: &mut EventSink,
    cancel: &CancellationToken,
    (request_timeout, idle_timeout): (Duration, Duration),
) -> Result<(), ChatError> {
    let res = tokio::select! {
        _ = cancel.cancelled() => return Err(ChatError::Aborted),
        res = tokio::time::timeout(request_timeout, request.send()) => {
            res.map_err(|_| ChatError::Timeout)??
        }
    };
    let res = check_status(res).await?;

    let mut body = res.bytes_stream();
    let mut decoder = SseDecoder::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Aborted),
            next = tokio::time::timeout(idle_timeout, body.next()) => next,
        };
        match next {
            Err(_) => {
                log::warn!("stream: no data for {:?}, finishing", idle_timeout);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(ChatError::Request(e)),
            Ok(Some(Ok(chunk))) => {
                let events = decoder
                    .push(&chunk)
                    .map_err(|e| ChatError::Parse(e.to_string()))?;
                for ev in events {
                    sink.emit(ev).await;
                }
                if decoder.is_finished() {
                    return Ok(());
                }
            }
        }
    }
    if let Some(ev) = decoder.finish() {
        sink.emit(ev).await;
    }
    Ok(())
}

/// Parsed non-streaming chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub raw: serde_json::Value,
}

impl ChatResponse {
    /// `choices[0].message.content`, or "" when absent.
    pub fn content(&self) -> &str {
        self.raw
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    messages: Vec<RequestMessage>,
    model: String,
    stream: bool,
    temperature: f32,
    presence_penalty: f32,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

impl ChatRequest {
    fn new(messages: &[Message], config: &ModelConfig, stream: bool) -> Self {
        Self {
            messages: messages
                .iter()
                .map(|m| RequestMessage {
                    role: m.role.as_str(),
                    content: m.prompt_content().to_string(),
                })
                .collect(),
            model: config.model.clone(),
            stream,
            temperature: config.temperature,
            presence_penalty: config.presence_penalty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageResponseFormat {
    Url,
    B64Json,
}

/// Body of an image generation request.
#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub n: u32,
    pub response_format: ImageResponseFormat,
    pub user: String,
    pub size: String,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            n: 1,
            response_format: ImageResponseFormat::Url,
            user: "parley".to_string(),
            size: size.into(),
        }
    }
}

/// One generated image: a URL or base64 payload depending on the response format.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageData {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub b64_json: Option<String>,
    #[serde(default)]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_does_not_double_v1() {
        let c = ChatClient::new(Some("http://localhost:8080/v1/".into()), None);
        assert_eq!(c.endpoint(CHAT_PATH), "http://localhost:8080/v1/chat/completions");
        let c = ChatClient::new(Some("http://localhost:8080".into()), None);
        assert_eq!(c.endpoint(IMAGE_PATH), "http://localhost:8080/v1/images/generations");
        let c = ChatClient::new(Some("  ".into()), None);
        assert_eq!(c.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn request_body_uses_prompt_content_and_config() {
        let mut user = Message::user("shown");
        user.augmented_content = Some("sent".into());
        let config = ModelConfig {
            model: "gpt-4".into(),
            temperature: 0.5,
            presence_penalty: 0.25,
            ..ModelConfig::default()
        };
        let body = ChatRequest::new(&[Message::system("be brief"), user], &config, true);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "sent" }
                ],
                "model": "gpt-4",
                "stream": true,
                "temperature": 0.5,
                "presence_penalty": 0.25
            })
        );
    }

    #[test]
    fn chat_response_content_pointer() {
        let r = ChatResponse {
            raw: serde_json::json!({ "choices": [{ "message": { "content": "Title" } }] }),
        };
        assert_eq!(r.content(), "Title");
        let empty = ChatResponse { raw: serde_json::json!({}) };
        assert_eq!(empty.content(), "");
    }

    #[test]
    fn image_request_serializes_format() {
        let req = ImageRequest::new("a crab", "512x512");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["response_format"], "url");
        assert_eq!(json["n"], 1);
        assert_eq!(json["size"], "512x512");
    }
}
