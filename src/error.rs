//! Error types for the orchestrator.

/// Top-level error type for the turn-taking pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Event bus publish/subscribe error.
    #[error("bus error: {0}")]
    Bus(String),

    /// Audio ingest or segmentation error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Streaming transcription error.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Text generation service error.
    #[error("generation error: {0}")]
    Generation(String),

    /// Speech synthesis service error.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Playback sink error.
    #[error("playback error: {0}")]
    Playback(String),

    /// Turn controller error.
    #[error("turn error: {0}")]
    Turn(String),

    /// Operator bridge error.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
