//! Speech synthesis service boundary.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::SynthesisConfig;
use crate::error::{OrchestratorError, Result};

/// One synthesis call per text batch, returning raw audio bytes.
///
/// Callers cancel by dropping the in-flight future; implementations must stay
/// usable for the next call after an abandoned one.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// HTTP synthesizer for piper-style servers: POST a JSON body with the text
/// and voice, receive raw audio back.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    config: SynthesisConfig,
}

impl HttpSynthesizer {
    /// Build the synthesizer and its HTTP client.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Synthesis` when the client cannot be
    /// constructed.
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| OrchestratorError::Synthesis(format!("client construction: {e}")))?;
        Ok(Self { client, config })
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "text": text,
            "voice": self.config.voice,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&self.request_body(text))
            .send()
            .await
            .map_err(|e| OrchestratorError::Synthesis(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Synthesis(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| OrchestratorError::Synthesis(format!("body read failed: {e}")))
    }
}
