//! Pure turn-taking state machine.
//!
//! The engine consumes bus payloads and returns the payloads to publish in
//! response. It performs no I/O and holds no channels, so every transition
//! is exercised directly in the unit tests below; the worker in the parent
//! module only moves events in and effects out.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::config::TurnConfig;
use crate::events::{
    CancelReason, GenerationRequest, Payload, ResponseIncrement, SessionState, Stage,
    SynthesisIncrement, Transcript, TurnId, UtteranceId,
};
use crate::turn::context::ContextWindow;

/// Phase of the one turn allowed in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    /// Generation requested, nothing audible yet.
    Thinking,
    /// First synthesized audio observed.
    Speaking,
}

struct ActiveTurn {
    id: TurnId,
    /// The utterance whose final transcript started the turn. Newer speech
    /// counts toward barge-in; the turn's own utterance never does.
    utterance: UtteranceId,
    phase: TurnPhase,
    response_text: String,
}

/// A final transcript held while another turn is active or input is blocked.
/// Latest wins.
struct PendingInput {
    utterance: UtteranceId,
    text: String,
}

pub struct TurnEngine {
    config: TurnConfig,
    chunk_ms: u32,
    state: SessionState,
    context: ContextWindow,
    next_turn: u64,
    active: Option<ActiveTurn>,
    pending: Option<PendingInput>,
    heard_speech: bool,
    degraded_stages: HashSet<Stage>,
    degraded_no_signal: bool,
}

impl TurnEngine {
    pub fn new(config: TurnConfig, chunk_ms: u32) -> Self {
        let context = ContextWindow::new(config.system_prompt.clone(), config.max_context_messages);
        Self {
            config,
            chunk_ms,
            state: SessionState::Idle,
            context,
            next_turn: 1,
            active: None,
            pending: None,
            heard_speech: false,
            degraded_stages: HashSet::new(),
            degraded_no_signal: false,
        }
    }

    /// Current conversational state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The turn currently in flight, if any.
    pub fn active_turn(&self) -> Option<TurnId> {
        self.active.as_ref().map(|active| active.id)
    }

    /// Apply one bus payload; returns the payloads to publish, in order.
    pub fn handle(&mut self, payload: &Payload) -> Vec<Payload> {
        match payload {
            Payload::UtteranceOpened { utterance } => self.on_utterance_opened(*utterance),
            Payload::SpeechFrames {
                utterance,
                voiced_ms,
            } => self.on_speech_frames(*utterance, *voiced_ms),
            Payload::Transcript(transcript) => self.on_transcript(transcript),
            Payload::Response(increment) => self.on_response(increment),
            Payload::Synthesis(increment) => self.on_synthesis(increment),
            Payload::StreamUnavailable { stage, .. } => self.on_stream_unavailable(*stage),
            Payload::StreamRecovered { stage } => self.on_stream_recovered(*stage),
            Payload::DeadlineExceeded { turn, .. } => self.on_deadline(*turn),
            Payload::NoSignalWarning { zero_chunks } => self.on_no_signal(*zero_chunks),
            Payload::SessionEnded { .. } => self.on_session_ended(),
            _ => Vec::new(),
        }
    }

    fn degraded(&self) -> bool {
        !self.degraded_stages.is_empty() || self.degraded_no_signal
    }

    /// Outages that hold new turns back. A transcription outage or a dead
    /// capture path blocks input; generation and synthesis outages do not,
    /// because their next attempt is also the stage's recovery probe.
    fn input_blocked(&self) -> bool {
        self.degraded_stages.contains(&Stage::Transcription) || self.degraded_no_signal
    }

    /// State to rest in when no turn is in flight.
    fn resting_state(&self) -> SessionState {
        if self.degraded() {
            SessionState::Degraded
        } else if self.heard_speech {
            SessionState::Listening
        } else {
            SessionState::Idle
        }
    }

    fn set_state(&mut self, to: SessionState, out: &mut Vec<Payload>) {
        if self.state == to {
            return;
        }
        info!("session state {} -> {to}", self.state);
        out.push(Payload::StateChanged {
            from: self.state,
            to,
        });
        self.state = to;
    }

    fn on_utterance_opened(&mut self, utterance: UtteranceId) -> Vec<Payload> {
        let mut out = Vec::new();
        self.heard_speech = true;
        if self.degraded_no_signal {
            self.degraded_no_signal = false;
            info!("capture signal returned with utterance {utterance}");
        }
        if self.active.is_none() {
            self.set_state(self.resting_state(), &mut out);
        }
        out
    }

    fn on_transcript(&mut self, transcript: &Transcript) -> Vec<Payload> {
        let mut out = Vec::new();
        if !transcript.is_final {
            return out;
        }
        let text = transcript.text.trim();
        if text.is_empty() {
            debug!("empty final transcript for utterance {}", transcript.utterance);
            return out;
        }
        if self.active.is_some() || self.input_blocked() {
            if self.pending.is_some() {
                debug!("pending input replaced by utterance {}", transcript.utterance);
            }
            self.pending = Some(PendingInput {
                utterance: transcript.utterance,
                text: text.to_owned(),
            });
            return out;
        }
        self.start_turn(transcript.utterance, text.to_owned(), &mut out);
        out
    }

    fn start_turn(&mut self, utterance: UtteranceId, text: String, out: &mut Vec<Payload>) {
        let id = TurnId::new(self.next_turn);
        self.next_turn += 1;
        info!("turn {id} started for utterance {utterance}: {text:?}");
        self.context.push_user(text);
        self.active = Some(ActiveTurn {
            id,
            utterance,
            phase: TurnPhase::Thinking,
            response_text: String::new(),
        });
        self.set_state(SessionState::Thinking, out);
        out.push(Payload::GenerationRequested(GenerationRequest {
            turn: id,
            context: self.context.messages(),
        }));
    }

    fn on_speech_frames(&mut self, utterance: UtteranceId, voiced_ms: u32) -> Vec<Payload> {
        let mut out = Vec::new();
        let Some(active) = self.active.as_ref() else {
            return out;
        };
        if utterance <= active.utterance {
            return out;
        }
        // A turn that is already audible yields quickly; one that is still
        // silent gets the longer window so a cough cannot cancel it.
        let confirm_ms = match active.phase {
            TurnPhase::Speaking => self.config.barge_in_confirm_ms,
            TurnPhase::Thinking => self.config.thinking_confirm_ms,
        };
        if voiced_ms < confirm_ms {
            return out;
        }
        info!("barge-in confirmed after {voiced_ms} ms of utterance {utterance}");
        self.cancel_active(CancelReason::BargeIn, &mut out);
        out
    }

    fn cancel_active(&mut self, reason: CancelReason, out: &mut Vec<Payload>) {
        let Some(active) = self.active.take() else {
            return;
        };
        if reason == CancelReason::BargeIn {
            self.set_state(SessionState::Interrupted, out);
        }
        info!("turn {} cancelled ({reason:?})", active.id);
        let partial = active.response_text.trim();
        if !partial.is_empty() {
            // The user heard (part of) this, so the next turn must see it.
            self.context.push_assistant(partial);
        }
        out.push(Payload::TurnCancelled {
            turn: active.id,
            reason,
        });
        out.push(Payload::PlaybackDiscard { turn: active.id });
        if reason == CancelReason::Deadline {
            out.push(Payload::Fallback {
                turn: active.id,
                text: self.config.fallback_text.clone(),
            });
        }
        if reason == CancelReason::Shutdown {
            return;
        }
        self.settle(out);
    }

    /// After a turn clears: start the held input if one may start, otherwise
    /// rest.
    fn settle(&mut self, out: &mut Vec<Payload>) {
        if !self.input_blocked()
            && let Some(pending) = self.pending.take()
        {
            self.start_turn(pending.utterance, pending.text, out);
            return;
        }
        self.set_state(self.resting_state(), out);
    }

    fn on_response(&mut self, increment: &ResponseIncrement) -> Vec<Payload> {
        if let Some(active) = self.active.as_mut()
            && increment.turn == active.id
            && !increment.text.is_empty()
        {
            active.response_text.push_str(&increment.text);
        }
        Vec::new()
    }

    fn on_synthesis(&mut self, increment: &SynthesisIncrement) -> Vec<Payload> {
        let mut out = Vec::new();
        let Some(id) = self.active.as_ref().map(|active| active.id) else {
            return out;
        };
        if increment.turn != id {
            debug!("synthesis increment for finished turn {}", increment.turn);
            return out;
        }
        if !increment.is_final {
            let was_thinking = self
                .active
                .as_ref()
                .is_some_and(|active| active.phase == TurnPhase::Thinking);
            if was_thinking {
                if let Some(active) = self.active.as_mut() {
                    active.phase = TurnPhase::Speaking;
                }
                self.set_state(SessionState::Speaking, &mut out);
            }
            return out;
        }
        let Some(active) = self.active.take() else {
            return out;
        };
        if increment.cancelled {
            warn!("cancelled terminal for turn {} the controller still held", active.id);
            self.settle(&mut out);
            return out;
        }
        let text = active.response_text.trim();
        if !text.is_empty() {
            self.context.push_assistant(text);
        }
        info!("turn {} completed ({} chars)", active.id, text.len());
        out.push(Payload::TurnCompleted { turn: active.id });
        self.settle(&mut out);
        out
    }

    fn on_stream_unavailable(&mut self, stage: Stage) -> Vec<Payload> {
        let mut out = Vec::new();
        warn!("{stage} stream unavailable; session degraded");
        self.degraded_stages.insert(stage);
        // An active turn is allowed to finish; the state falls to Degraded
        // when it settles.
        if self.active.is_none() {
            self.set_state(SessionState::Degraded, &mut out);
        }
        out
    }

    fn on_stream_recovered(&mut self, stage: Stage) -> Vec<Payload> {
        let mut out = Vec::new();
        info!("{stage} stream recovered");
        self.degraded_stages.remove(&stage);
        if self.active.is_none() {
            self.settle(&mut out);
        }
        out
    }

    fn on_deadline(&mut self, turn: TurnId) -> Vec<Payload> {
        let mut out = Vec::new();
        if !self.active.as_ref().is_some_and(|active| active.id == turn) {
            debug!("deadline for inactive turn {turn}, ignored");
            return out;
        }
        warn!("turn {turn} exceeded the hard latency budget; cancelling");
        self.cancel_active(CancelReason::Deadline, &mut out);
        out
    }

    fn on_no_signal(&mut self, zero_chunks: u32) -> Vec<Payload> {
        let mut out = Vec::new();
        let silent_ms = u64::from(zero_chunks) * u64::from(self.chunk_ms);
        if silent_ms < self.config.degraded_after_ms || self.degraded_no_signal {
            return out;
        }
        self.degraded_no_signal = true;
        warn!("input silent for {silent_ms} ms; session degraded");
        if self.active.is_none() {
            self.set_state(SessionState::Degraded, &mut out);
        }
        out
    }

    fn on_session_ended(&mut self) -> Vec<Payload> {
        let mut out = Vec::new();
        self.cancel_active(CancelReason::Shutdown, &mut out);
        out
    }
}
