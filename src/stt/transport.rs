//! Streaming transcription transport.
//!
//! The connector opens one duplex session per attempt: binary PCM frames and
//! JSON control messages go up, transcript messages come back. Implementations
//! spawn their own pump tasks; dropping the link tears the session down.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::config::{AudioConfig, SttConfig};
use crate::error::{OrchestratorError, Result};
use crate::events::SessionId;

/// Outbound frames queued per link.
const AUDIO_FRAME_CHANNEL_SIZE: usize = 64;
/// Inbound link events queued per link.
const LINK_EVENT_CHANNEL_SIZE: usize = 64;

/// One transcript message from the service.
#[derive(Debug, Clone)]
pub struct WireTranscript {
    pub text: String,
    pub is_final: bool,
    /// Service-side segment key; changes when the server starts a new segment.
    pub utterance_key: String,
}

/// Events surfaced by an open link.
#[derive(Debug)]
pub enum LinkEvent {
    Transcript(WireTranscript),
    /// The connection ended; `detail` says why.
    Closed { detail: String },
}

/// Frames sent towards the service.
#[derive(Debug)]
pub enum AudioFrame {
    /// Raw little-endian 16-bit PCM.
    Pcm(Bytes),
    /// The segmenter closed the current utterance.
    EndOfUtterance,
}

/// An open duplex streaming session.
pub struct TranscriptionLink {
    pub audio_tx: mpsc::Sender<AudioFrame>,
    pub events_rx: mpsc::Receiver<LinkEvent>,
}

/// Connection factory for the transcription service.
#[async_trait]
pub trait TranscriptionConnector: Send + Sync {
    /// Open one streaming session.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Transcription` when the service cannot be
    /// reached or rejects the session.
    async fn connect(&self, session: SessionId) -> Result<TranscriptionLink>;

    /// Cheap readiness probe used between reconnect attempts.
    async fn ready(&self) -> bool;
}

/// Little-endian byte view of 16-bit samples, as the service expects them.
pub fn pcm_bytes(samples: &[i16]) -> Bytes {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(buf)
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    utterance_id: String,
    #[serde(default)]
    message: String,
}

/// WebSocket connector speaking the transcription service's JSON protocol:
/// a `start` message carrying session metadata, binary PCM audio frames,
/// `transcript` messages back, and `end_of_utterance`/`stop` marks.
#[derive(Debug)]
pub struct WsTranscriptionConnector {
    endpoint: Url,
    sample_rate: u32,
    language: String,
}

impl WsTranscriptionConnector {
    /// # Errors
    /// Returns `OrchestratorError::Config` when the endpoint is not a valid URL.
    pub fn new(stt: &SttConfig, audio: &AudioConfig) -> Result<Self> {
        let endpoint = Url::parse(&stt.endpoint)
            .map_err(|e| OrchestratorError::Config(format!("stt endpoint: {e}")))?;
        Ok(Self {
            endpoint,
            sample_rate: audio.sample_rate,
            language: stt.language.clone(),
        })
    }
}

#[async_trait]
impl TranscriptionConnector for WsTranscriptionConnector {
    async fn connect(&self, session: SessionId) -> Result<TranscriptionLink> {
        let (ws, _response) = connect_async(self.endpoint.as_str()).await.map_err(|e| {
            OrchestratorError::Transcription(format!("connect {}: {e}", self.endpoint))
        })?;
        let (mut sink, mut stream) = ws.split();

        let start = json!({
            "type": "start",
            "uid": session.to_string(),
            "sample_rate": self.sample_rate,
            "language": self.language,
        });
        sink.send(Message::Text(start.to_string()))
            .await
            .map_err(|e| OrchestratorError::Transcription(format!("start message: {e}")))?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<AudioFrame>(AUDIO_FRAME_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel::<LinkEvent>(LINK_EVENT_CHANNEL_SIZE);

        tokio::spawn(async move {
            while let Some(frame) = audio_rx.recv().await {
                let message = match frame {
                    AudioFrame::Pcm(bytes) => Message::Binary(bytes.to_vec()),
                    AudioFrame::EndOfUtterance => {
                        Message::Text(json!({"type": "end_of_utterance"}).to_string())
                    }
                };
                if let Err(e) = sink.send(message).await {
                    debug!("transcription writer stopped: {e}");
                    return;
                }
            }
            // Orderly teardown when the manager drops its sender.
            let _ = sink
                .send(Message::Text(json!({"type": "stop"}).to_string()))
                .await;
            let _ = sink.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: ServerMessage = match serde_json::from_str(&text) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                debug!("unparseable transcription message: {e}");
                                continue;
                            }
                        };
                        match parsed.kind.as_str() {
                            "transcript" => {
                                let transcript = WireTranscript {
                                    text: parsed.text,
                                    is_final: parsed.is_final,
                                    utterance_key: parsed.utterance_id,
                                };
                                if events_tx
                                    .send(LinkEvent::Transcript(transcript))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            "error" => {
                                warn!("transcription service error: {}", parsed.message);
                                let _ = events_tx
                                    .send(LinkEvent::Closed {
                                        detail: parsed.message,
                                    })
                                    .await;
                                return;
                            }
                            // Session acks and status messages carry nothing we use.
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx
                            .send(LinkEvent::Closed {
                                detail: "connection closed".to_owned(),
                            })
                            .await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events_tx
                            .send(LinkEvent::Closed {
                                detail: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(TranscriptionLink { audio_tx, events_rx })
    }

    async fn ready(&self) -> bool {
        match connect_async(self.endpoint.as_str()).await {
            Ok((mut ws, _)) => {
                let _ = ws.close(None).await;
                true
            }
            Err(_) => false,
        }
    }
}
