//! Streaming client for the OpenAI-compatible chat completion API.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::GenerationRequest;
use crate::generation::sse::{SseLineParser, is_done};

/// Ordered text fragments from one streaming completion. The stream ends
/// after the service's done sentinel or yields one `Err` on a broken read.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens streaming completions. The coordinator drives retries and
/// cancellation; a client call is one attempt.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Issue one streaming request for the accumulated context.
    ///
    /// # Errors
    /// Returns an error when the connection or the HTTP exchange fails before
    /// any fragment is produced.
    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream>;
}

/// `reqwest`-based client speaking `POST …/chat/completions` with
/// `stream: true`, as served by Ollama and compatible servers.
pub struct OpenAiGenerationClient {
    client: reqwest::Client,
    config: GenerationConfig,
}

impl OpenAiGenerationClient {
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| OrchestratorError::Generation(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        json!({
            "model": self.config.model,
            "messages": request.context,
            "stream": true,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        })
    }
}

#[async_trait]
impl GenerationClient for OpenAiGenerationClient {
    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream> {
        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let mut http = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if !self.config.api_key.is_empty() {
            http = http.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = http
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| OrchestratorError::Generation(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Generation(format!(
                "HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&body)
            )));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut parser = SseLineParser::new();
            while let Some(next) = bytes.next().await {
                match next {
                    Ok(chunk) => {
                        for data in parser.push(&chunk) {
                            if is_done(&data) {
                                return;
                            }
                            match delta_text(&data) {
                                Some(text) if !text.is_empty() => yield Ok(text),
                                Some(_) => {}
                                None => debug!("undecodable stream chunk: {data:?}"),
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(OrchestratorError::Generation(format!("stream read: {e}")));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Pull `choices[0].delta.content` out of one streamed chunk. Chunks without
/// content (role prelude, finish markers) return `None` or empty.
fn delta_text(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(str::to_owned)
}

/// Best-effort extraction of `error.message` from an error response body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}
