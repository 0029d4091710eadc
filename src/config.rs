//! Configuration types for the turn-taking orchestrator.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{OrchestratorError, Result};

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Event bus queue sizing.
    pub bus: BusConfig,
    /// Audio ingest settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Streaming transcription settings.
    pub stt: SttConfig,
    /// Text generation settings.
    pub generation: GenerationConfig,
    /// Speech synthesis settings.
    pub synthesis: SynthesisConfig,
    /// Turn-taking controller settings.
    pub turn: TurnConfig,
    /// Latency budget settings.
    pub latency: LatencyConfig,
    /// Operator bridge settings.
    pub bridge: BridgeConfig,
}

impl OrchestratorConfig {
    /// Parse a TOML document; absent keys take their defaults.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Config` when the document is not valid TOML
    /// or a field has the wrong type.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Io` when the file cannot be read, or
    /// `OrchestratorError::Config` when it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Event bus queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber queue depth on blocking topics.
    pub queue_depth: usize,
    /// Per-subscriber queue depth on the lossy audio topic.
    ///
    /// 32 chunks of 100 ms bound a stalled consumer at ~3 s of stale audio.
    pub audio_queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            audio_queue_depth: 32,
        }
    }
}

/// Audio ingest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz (mono, 16-bit).
    pub sample_rate: u32,
    /// Chunk duration in ms; 100 ms at 16 kHz is 1600 samples (3200 bytes).
    pub chunk_ms: u32,
}

impl AudioConfig {
    /// Samples per chunk at the configured rate.
    pub fn samples_per_chunk(&self) -> usize {
        (self.sample_rate as u64 * u64::from(self.chunk_ms) / 1000).max(1) as usize
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_ms: 100,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold to enter speech.
    ///
    /// Energies are normalized to \[0, 1\]. Typical values:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default, good for most environments)
    ///   - 0.02:  reduced sensitivity (noisy environments)
    ///   - 0.05:  low sensitivity (only loud/close speech)
    pub rising_threshold: f32,
    /// RMS energy threshold to stay in speech. Kept below `rising_threshold`
    /// so energy hovering near the boundary does not chatter.
    pub falling_threshold: f32,
    /// Silence duration in ms that closes an open utterance.
    pub hangover_ms: u32,
    /// Consecutive zero-energy chunks before a no-signal warning.
    pub no_signal_chunks: u32,
    /// Energy floor below which a chunk counts as zero-energy (dead mic).
    pub no_signal_floor: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            rising_threshold: 0.01,
            falling_threshold: 0.008,
            hangover_ms: 500,
            no_signal_chunks: 50,
            no_signal_floor: 0.000_01,
        }
    }
}

/// Streaming transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// WebSocket endpoint of the transcription service.
    pub endpoint: String,
    /// Language hint sent in the session start message.
    pub language: String,
    /// Connection attempts before the stream is declared unavailable.
    pub connect_attempts: u32,
    /// Base reconnect delay in ms; doubles per attempt, with jitter.
    pub backoff_base_ms: u64,
    /// Audio buffered while disconnected, in ms; older audio is dropped and
    /// reported as data loss.
    pub buffer_ms: u32,
    /// Interval between health probes once the retry budget is exhausted.
    pub probe_interval_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9090".to_owned(),
            language: "en".to_owned(),
            connect_attempts: 3,
            backoff_base_ms: 250,
            buffer_ms: 2000,
            probe_interval_ms: 5000,
        }
    }
}

/// Text generation configuration (OpenAI-compatible streaming API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Base URL of the API server, e.g. an Ollama instance.
    pub endpoint: String,
    /// Model name to request.
    pub model: String,
    /// API key; empty for local servers.
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Connection attempts before the stream is declared unavailable.
    pub connect_attempts: u32,
    /// Base retry delay in ms; doubles per attempt, with jitter.
    pub backoff_base_ms: u64,
    /// TCP connect timeout in ms.
    pub connect_timeout_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/v1".to_owned(),
            model: "llama3.2:3b".to_owned(),
            api_key: String::new(),
            temperature: 0.7,
            max_tokens: 512,
            connect_attempts: 3,
            backoff_base_ms: 250,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// HTTP endpoint returning raw audio for a text increment.
    pub endpoint: String,
    /// Voice identifier passed with each request.
    pub voice: String,
    /// Minimum batch length in characters before a clause boundary is taken.
    pub min_clause_len: usize,
    /// Attempts per batch before the stage is declared unavailable.
    pub connect_attempts: u32,
    /// Base retry delay in ms; doubles per attempt, with jitter.
    pub backoff_base_ms: u64,
    /// TCP connect timeout in ms.
    pub connect_timeout_ms: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5002/api/tts".to_owned(),
            voice: "en_US-lessac-medium".to_owned(),
            min_clause_len: 20,
            connect_attempts: 3,
            backoff_base_ms: 250,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Turn-taking controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// System prompt seeding the conversation context.
    pub system_prompt: String,
    /// Context messages kept after trimming (the system prompt survives).
    pub max_context_messages: usize,
    /// Voiced ms required to confirm a barge-in while speaking.
    pub barge_in_confirm_ms: u32,
    /// Voiced ms required to cancel a turn that has produced no audio yet.
    /// Matches the VAD hangover window so transient noise cannot cancel a
    /// turn the user is still waiting on.
    pub thinking_confirm_ms: u32,
    /// With no valid utterance for this long after a no-signal warning, the
    /// session is flagged degraded.
    pub degraded_after_ms: u64,
    /// Caller-supplied apology spoken/shown when the hard latency budget
    /// cancels a turn. Never generated locally.
    pub fallback_text: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful voice assistant. Keep responses short and \
                            conversational."
                .to_owned(),
            max_context_messages: 20,
            barge_in_confirm_ms: 300,
            thinking_confirm_ms: 500,
            degraded_after_ms: 30_000,
            fallback_text: "Sorry, I'm having trouble answering right now. Could you say that \
                            again?"
                .to_owned(),
        }
    }
}

/// Latency budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Soft budget in ms from utterance end to first synthesized audio;
    /// exceeding it emits a diagnostic only.
    pub soft_budget_ms: u64,
    /// Hard budget in ms; exceeding it cancels the turn and surfaces the
    /// fallback utterance.
    pub hard_budget_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            soft_budget_ms: 2000,
            hard_budget_ms: 8000,
        }
    }
}

/// Operator bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Whether the bridge listener is started at all.
    pub enabled: bool,
    /// Bind address for the WebSocket endpoint.
    pub bind: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8765".to_owned(),
        }
    }
}
