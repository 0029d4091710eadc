//! Blether: turn-taking orchestration for real-time voice conversations.
//!
//! This crate coordinates a cascaded voice pipeline over one event bus:
//! capture, voice activity detection, streaming transcription, turn taking,
//! response generation, speech synthesis, and playback.
//!
//! # Architecture
//!
//! Independent workers share a topic-partitioned [`bus::EventBus`]:
//! - **Audio ingest**: chunks raw capture buffers and segments utterances
//! - **STT**: streams audio to a WebSocket transcription service
//! - **Turn controller**: owns the conversation state machine and barge-in
//! - **Generation**: streams chat completions from an OpenAI-compatible API
//! - **Synthesis**: batches response text into HTTP text-to-speech calls
//! - **Playback feed**: orders and discards audio for the embedder's sink
//! - **Operator bridge**: optional WebSocket endpoint mirroring the session
//!
//! [`Orchestrator`] wires one session end to end. Every external service sits
//! behind a trait seam, so tests and embedders can swap implementations.

pub mod audio;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod generation;
pub mod latency;
pub mod orchestrator;
pub mod playback;
pub mod stt;
pub mod synthesis;
pub mod turn;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, Services};
pub use playback::PlaybackSink;
