//! Event types crossing the bus.
//!
//! Every signal between pipeline components travels as an [`Event`]: a session-tagged,
//! timestamped envelope around one [`Payload`]. The payload variant determines the
//! topic it is published on; components never hold references into each other.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::Topic;

/// Identifier for one conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocate a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic identifier for one turn, allocated by the turn controller.
///
/// Ids increase in allocation order within a session, so "newer turn" is a
/// plain numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(u64);

impl TurnId {
    /// Wrap a raw value. Live sessions mint ids through the turn controller;
    /// this exists for tooling that replays or fabricates events.
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic identifier for one contiguous span of detected speech, allocated
/// by the segmenter when silence transitions to speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtteranceId(u64);

impl UtteranceId {
    /// Wrap a raw value. Live sessions mint ids through the segmenter; this
    /// exists for tooling that replays or fabricates events.
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversational state of a session. Owned by the turn controller; other
/// components observe it through `StateChanged` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session activity expected.
    Idle,
    /// Awaiting or accumulating user speech.
    Listening,
    /// Generation in flight, nothing audible yet.
    Thinking,
    /// Synthesized audio is being played.
    Speaking,
    /// Barge-in detected, cancellation in progress.
    Interrupted,
    /// An upstream stream is unavailable or input has gone silent.
    Degraded,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
            Self::Degraded => "degraded",
        };
        write!(f, "{name}")
    }
}

/// External service stage named in availability and loss diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Transcription,
    Generation,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transcription => "transcription",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
        };
        write!(f, "{name}")
    }
}

/// Why a turn was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The user spoke over the active turn.
    BargeIn,
    /// The hard latency budget expired before audio was produced.
    Deadline,
    /// An upstream stream failed mid-turn.
    StreamFailed,
    /// Session shutdown.
    Shutdown,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The capture source closed its channel.
    CaptureClosed,
    /// The playback sink reported an unrecoverable error.
    PlaybackFailed,
    /// Orderly shutdown.
    Shutdown,
}

/// A fixed-duration slice of mono PCM audio from the capture source.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// 16-bit samples, mono, at `sample_rate`.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Position of this chunk in the capture stream, starting at 0.
    pub sequence: u64,
    /// Timestamp when the chunk was completed.
    pub captured_at: Instant,
    /// RMS energy normalized to [0, 1].
    pub energy: f32,
}

impl AudioChunk {
    /// Duration of the chunk in milliseconds.
    pub fn duration_ms(&self) -> u32 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000 / u64::from(self.sample_rate)) as u32
    }
}

/// A partial or final transcription result for one utterance.
#[derive(Debug, Clone)]
pub struct Transcript {
    /// The utterance this text belongs to.
    pub utterance: UtteranceId,
    /// Transcribed text. Partials are superseded by later partials with a
    /// higher sequence for the same utterance.
    pub text: String,
    /// Whether this closes the utterance.
    pub is_final: bool,
    /// Monotonic position within the utterance.
    pub sequence: u32,
    /// When the transcript was received.
    pub at: Instant,
}

/// Role of one message in the conversation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message in the conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    #[serde(rename = "content")]
    pub text: String,
}

/// Request to the generation coordinator: the accumulated dialogue context for
/// one turn, oldest message first.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub turn: TurnId,
    pub context: Vec<ChatTurn>,
}

/// One ordered text fragment of a generated response.
#[derive(Debug, Clone)]
pub struct ResponseIncrement {
    /// The owning turn.
    pub turn: TurnId,
    /// Text fragment; empty on a standalone terminal marker.
    pub text: String,
    /// Monotonic position within the turn, starting at 0.
    pub sequence: u32,
    /// Whether this is the last increment for the turn.
    pub is_final: bool,
    /// Set on the terminal increment when the turn was cancelled.
    pub cancelled: bool,
}

/// One ordered audio increment of a synthesized response.
#[derive(Debug, Clone)]
pub struct SynthesisIncrement {
    /// The owning turn.
    pub turn: TurnId,
    /// Raw audio bytes; empty on a standalone terminal marker.
    pub audio: Bytes,
    /// Monotonic position within the turn, starting at 0.
    pub sequence: u32,
    /// Whether this is the last increment for the turn.
    pub is_final: bool,
    /// Set on the terminal increment when the turn was cancelled.
    pub cancelled: bool,
}

/// Everything that can cross the bus.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A capture chunk, for the transcription feed.
    Audio(AudioChunk),
    /// The segmenter opened a new utterance (silence became speech).
    UtteranceOpened { utterance: UtteranceId },
    /// A voiced chunk inside an open utterance, with the cumulative voiced time.
    SpeechFrames { utterance: UtteranceId, voiced_ms: u32 },
    /// The utterance closed after the hangover window of silence.
    UtteranceClosed { utterance: UtteranceId, voiced_ms: u32 },
    /// Sustained zero-energy input was detected.
    NoSignalWarning { zero_chunks: u32 },
    /// A partial or final transcript.
    Transcript(Transcript),
    /// The controller started a turn and wants a response generated.
    GenerationRequested(GenerationRequest),
    /// A generated text fragment.
    Response(ResponseIncrement),
    /// A synthesized audio fragment.
    Synthesis(SynthesisIncrement),
    /// The controller cancelled a turn; coordinators stop work for it.
    TurnCancelled { turn: TurnId, reason: CancelReason },
    /// A turn reached its natural end.
    TurnCompleted { turn: TurnId },
    /// Queued but unplayed audio for the turn must be discarded.
    PlaybackDiscard { turn: TurnId },
    /// The session moved between conversational states.
    StateChanged { from: SessionState, to: SessionState },
    /// A service stage exhausted its retry budget.
    StreamUnavailable { stage: Stage, detail: String },
    /// A previously unavailable stage is reachable again.
    StreamRecovered { stage: Stage },
    /// Buffered data was dropped while a stage was down.
    DataLoss { stage: Stage, dropped: u64 },
    /// A subscriber handler returned an error; delivery continued without it.
    HandlerFault {
        topic: Topic,
        subscriber: String,
        detail: String,
    },
    /// First audio arrived later than the soft budget allows.
    LatencyBudgetExceeded {
        turn: TurnId,
        elapsed_ms: u64,
        budget_ms: u64,
    },
    /// The hard budget expired with no audio; the controller will cancel.
    DeadlineExceeded { turn: TurnId, elapsed_ms: u64 },
    /// Caller-supplied apology text surfaced after a forced cancellation.
    Fallback { turn: TurnId, text: String },
    /// The session is over; workers wind down.
    SessionEnded { reason: EndReason },
}

impl Payload {
    /// The topic this payload is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::Audio(_) => Topic::Audio,
            Self::UtteranceOpened { .. }
            | Self::SpeechFrames { .. }
            | Self::UtteranceClosed { .. } => Topic::Vad,
            Self::Transcript(_) => Topic::Transcripts,
            Self::GenerationRequested(_) | Self::TurnCancelled { .. } | Self::TurnCompleted { .. } => {
                Topic::Turns
            }
            Self::Response(_) => Topic::Responses,
            Self::Synthesis(_) => Topic::Synthesis,
            Self::PlaybackDiscard { .. } => Topic::Playback,
            Self::StateChanged { .. }
            | Self::StreamUnavailable { .. }
            | Self::StreamRecovered { .. }
            | Self::DeadlineExceeded { .. }
            | Self::Fallback { .. }
            | Self::SessionEnded { .. } => Topic::Control,
            Self::NoSignalWarning { .. }
            | Self::DataLoss { .. }
            | Self::HandlerFault { .. }
            | Self::LatencyBudgetExceeded { .. } => Topic::Diagnostics,
        }
    }
}

/// The envelope crossing the bus: one payload, tagged with its session and
/// publish time.
#[derive(Debug, Clone)]
pub struct Event {
    pub session: SessionId,
    pub at: Instant,
    pub payload: Payload,
}

impl Event {
    /// Wrap a payload, stamping the current time.
    pub fn new(session: SessionId, payload: Payload) -> Self {
        Self {
            session,
            at: Instant::now(),
            payload,
        }
    }

    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }

    /// The turn this event concerns, when it concerns exactly one.
    pub fn turn(&self) -> Option<TurnId> {
        match &self.payload {
            Payload::GenerationRequested(request) => Some(request.turn),
            Payload::Response(increment) => Some(increment.turn),
            Payload::Synthesis(increment) => Some(increment.turn),
            Payload::TurnCancelled { turn, .. }
            | Payload::TurnCompleted { turn }
            | Payload::PlaybackDiscard { turn }
            | Payload::LatencyBudgetExceeded { turn, .. }
            | Payload::DeadlineExceeded { turn, .. }
            | Payload::Fallback { turn, .. } => Some(*turn),
            _ => None,
        }
    }
}
