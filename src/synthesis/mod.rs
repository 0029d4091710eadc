//! Speech synthesis: turns streamed response text into ordered audio.
//!
//! The coordinator consumes `ResponseIncrement`s for the active turn, batches
//! text at clause boundaries, issues one synthesis call per batch, and
//! publishes each result as a tagged `SynthesisIncrement`. Every observed turn
//! gets exactly one terminal increment, whether it completed, failed, or was
//! cancelled; a turn whose response carried no speakable text still gets its
//! terminal.

pub mod batcher;
pub mod client;

pub use batcher::ClauseBatcher;
pub use client::{HttpSynthesizer, SpeechSynthesizer};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription, Topic};
use crate::config::SynthesisConfig;
use crate::events::{Payload, ResponseIncrement, SessionId, Stage, SynthesisIncrement, TurnId};

/// Exponential backoff with up to 25% jitter, doubling per attempt.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.clamp(1, 10) - 1;
    let delay = base_ms.saturating_mul(1 << shift);
    let jitter = rand::thread_rng().gen_range(0..=delay / 4);
    Duration::from_millis(delay + jitter)
}

/// Worker: batches response text and drives the synthesizer, one turn at a
/// time.
///
/// Turn events consumed while a call is in flight can only concern the active
/// turn; the controller serializes turns.
pub async fn run_synthesis(
    bus: EventBus,
    session: SessionId,
    config: SynthesisConfig,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    cancel: CancellationToken,
) {
    let mut responses_sub = bus.subscribe(Topic::Responses, "synthesis");
    let mut turns_sub = bus.subscribe(Topic::Turns, "synthesis");
    info!(
        "synthesis coordinator started ({}, voice {})",
        config.endpoint, config.voice
    );
    let mut manager = SynthesisManager {
        bus,
        session,
        config,
        synthesizer,
        current: None,
        done_through: 0,
        failed: false,
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            maybe = turns_sub.recv() => {
                let Some(event) = maybe else { break };
                if let Payload::TurnCancelled { turn, .. } = event.payload {
                    manager.on_cancelled(turn).await;
                }
            }

            maybe = responses_sub.recv() => {
                let Some(event) = maybe else { break };
                let Payload::Response(increment) = event.payload else { continue };
                manager.on_response(increment, &mut turns_sub, &cancel).await;
            }
        }
    }
    debug!("synthesis coordinator stopped");
}

/// Result of one batch synthesis.
enum Outcome {
    Audio(Bytes),
    Failed,
    Cancelled,
}

/// Batching and delivery state for the synthesis stage.
struct SynthesisManager {
    bus: EventBus,
    session: SessionId,
    config: SynthesisConfig,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    current: Option<ActiveSynth>,
    /// Highest turn id already given its terminal increment.
    done_through: u64,
    /// Set while the stage has an unresolved StreamUnavailable outstanding.
    failed: bool,
}

/// The turn currently being synthesized.
struct ActiveSynth {
    turn: TurnId,
    batcher: ClauseBatcher,
    /// Audio increments emitted so far; the terminal takes the next index.
    sequence: u32,
    /// Set after a failed batch; remaining batches for this turn are dropped.
    skip: bool,
}

impl SynthesisManager {
    async fn on_response(
        &mut self,
        increment: ResponseIncrement,
        turns_sub: &mut Subscription,
        cancel: &CancellationToken,
    ) {
        let turn = increment.turn;
        if turn.value() <= self.done_through {
            // Late fragment for a turn already closed out.
            return;
        }

        // The first increment observed for a turn opens it. A still-open
        // previous turn is closed out first so its terminal is never lost.
        let stale = match &self.current {
            Some(active) if active.turn != turn => self.current.take(),
            _ => None,
        };
        if let Some(stale) = stale {
            warn!(
                "response for turn {turn} arrived while turn {} was open; closing it",
                stale.turn
            );
            self.finish_turn(stale.turn, stale.sequence, false).await;
        }
        if self.current.is_none() {
            self.current = Some(ActiveSynth {
                turn,
                batcher: ClauseBatcher::new(self.config.min_clause_len),
                sequence: 0,
                skip: false,
            });
        }

        if increment.cancelled {
            if let Some(active) = self.current.take() {
                debug!("generation terminal for turn {turn} arrived cancelled");
                self.finish_turn(turn, active.sequence, true).await;
            }
            return;
        }

        let mut batches = Vec::new();
        if let Some(active) = &mut self.current {
            batches = active.batcher.push(&increment.text);
            if increment.is_final
                && let Some(tail) = active.batcher.flush()
            {
                batches.push(tail);
            }
        }

        for text in batches {
            if !self.speak(turn, &text, turns_sub, cancel).await {
                return;
            }
        }

        if increment.is_final
            && let Some(active) = self.current.take()
        {
            info!(
                "synthesis for turn {turn} complete ({} increments)",
                active.sequence
            );
            self.finish_turn(turn, active.sequence, false).await;
        }
    }

    async fn on_cancelled(&mut self, turn: TurnId) {
        if turn.value() <= self.done_through {
            return;
        }
        match self.current.take() {
            Some(active) if active.turn == turn => {
                info!(
                    "synthesis for turn {turn} cancelled after {} increments",
                    active.sequence
                );
                self.finish_turn(turn, active.sequence, true).await;
            }
            Some(active) => {
                self.current = Some(active);
                self.finish_turn(turn, 0, true).await;
            }
            None => {
                debug!("turn {turn} cancelled before any response text arrived");
                self.finish_turn(turn, 0, true).await;
            }
        }
    }

    /// Synthesize one batch and publish its audio increment. Returns false
    /// when the turn was cancelled mid-call and its terminal already sent.
    async fn speak(
        &mut self,
        turn: TurnId,
        text: &str,
        turns_sub: &mut Subscription,
        cancel: &CancellationToken,
    ) -> bool {
        if self.current.as_ref().is_some_and(|active| active.skip) {
            debug!("dropping batch for turn {turn} while synthesis is unavailable");
            return true;
        }

        match self.synthesize_with_retry(turn, text, turns_sub, cancel).await {
            Outcome::Audio(audio) => {
                let Some(active) = &mut self.current else {
                    return true;
                };
                let sequence = active.sequence;
                active.sequence += 1;
                self.emit_increment(turn, audio, sequence, false, false).await;
                true
            }
            Outcome::Failed => {
                if let Some(active) = &mut self.current {
                    active.skip = true;
                }
                true
            }
            Outcome::Cancelled => {
                if let Some(active) = self.current.take() {
                    info!("synthesis for turn {turn} cancelled mid-call");
                    self.finish_turn(turn, active.sequence, true).await;
                }
                false
            }
        }
    }

    /// One batch with bounded retries; the in-flight call is raced against
    /// turn cancellation so abandoning it is immediate.
    async fn synthesize_with_retry(
        &mut self,
        turn: TurnId,
        text: &str,
        turns_sub: &mut Subscription,
        cancel: &CancellationToken,
    ) -> Outcome {
        let synthesizer = Arc::clone(&self.synthesizer);
        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            let call = synthesizer.synthesize(text);
            tokio::pin!(call);
            let result = loop {
                tokio::select! {
                    () = cancel.cancelled() => return Outcome::Cancelled,
                    result = &mut call => break result,
                    maybe = turns_sub.recv() => {
                        match maybe {
                            Some(event) => {
                                if matches!(event.payload, Payload::TurnCancelled { turn: t, .. } if t == turn) {
                                    return Outcome::Cancelled;
                                }
                            }
                            None => return Outcome::Cancelled,
                        }
                    }
                }
            };
            match result {
                Ok(audio) => {
                    if self.failed {
                        self.failed = false;
                        self.bus
                            .emit(
                                self.session,
                                Payload::StreamRecovered {
                                    stage: Stage::Synthesis,
                                },
                            )
                            .await;
                    }
                    return Outcome::Audio(audio);
                }
                Err(e) if attempt < attempts => {
                    let delay = backoff_delay(self.config.backoff_base_ms, attempt);
                    warn!("synthesis attempt {attempt} failed: {e}; retrying in {delay:?}");
                    if backoff_wait(turns_sub, turn, delay, cancel).await {
                        return Outcome::Cancelled;
                    }
                }
                Err(e) => {
                    warn!("synthesis unavailable after {attempt} attempts: {e}");
                    if !self.failed {
                        self.failed = true;
                        self.bus
                            .emit(
                                self.session,
                                Payload::StreamUnavailable {
                                    stage: Stage::Synthesis,
                                    detail: e.to_string(),
                                },
                            )
                            .await;
                    }
                    return Outcome::Failed;
                }
            }
        }
        Outcome::Failed
    }

    async fn finish_turn(&mut self, turn: TurnId, sequence: u32, cancelled: bool) {
        self.done_through = self.done_through.max(turn.value());
        self.emit_increment(turn, Bytes::new(), sequence, true, cancelled)
            .await;
    }

    async fn emit_increment(
        &self,
        turn: TurnId,
        audio: Bytes,
        sequence: u32,
        is_final: bool,
        cancelled: bool,
    ) {
        self.bus
            .emit(
                self.session,
                Payload::Synthesis(SynthesisIncrement {
                    turn,
                    audio,
                    sequence,
                    is_final,
                    cancelled,
                }),
            )
            .await;
    }
}

/// Sleep out a retry delay; returns true when the turn was cancelled (or the
/// session shut down) while waiting.
async fn backoff_wait(
    turns_sub: &mut Subscription,
    turn: TurnId,
    delay: Duration,
    cancel: &CancellationToken,
) -> bool {
    let wait = tokio::time::sleep(delay);
    tokio::pin!(wait);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return true,
            () = &mut wait => return false,
            maybe = turns_sub.recv() => {
                match maybe {
                    Some(event) => {
                        if matches!(event.payload, Payload::TurnCancelled { turn: t, .. } if t == turn) {
                            return true;
                        }
                    }
                    None => return true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::BusConfig;
    use crate::error::OrchestratorError;
    use crate::events::CancelReason;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted synthesizer: the deque decides each call's outcome, with
    /// success as the default once exhausted. Records call texts.
    struct ScriptedSynthesizer {
        script: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedSynthesizer {
        fn with_script(script: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn always_ok() -> Arc<Self> {
            Self::with_script(Vec::new())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for ScriptedSynthesizer {
        async fn synthesize(&self, text: &str) -> crate::Result<Bytes> {
            self.calls.lock().unwrap().push(text.to_owned());
            if self.script.lock().unwrap().pop_front().unwrap_or(true) {
                Ok(Bytes::from(format!("pcm:{text}")))
            } else {
                Err(OrchestratorError::Synthesis("scripted refusal".into()))
            }
        }
    }

    /// Never completes a call; used to test mid-call cancellation.
    struct HangingSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for HangingSynthesizer {
        async fn synthesize(&self, _text: &str) -> crate::Result<Bytes> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn response(turn: u64, text: &str, sequence: u32, is_final: bool) -> Payload {
        Payload::Response(ResponseIncrement {
            turn: TurnId::new(turn),
            text: text.to_owned(),
            sequence,
            is_final,
            cancelled: false,
        })
    }

    async fn recv_synthesis(sub: &mut Subscription) -> SynthesisIncrement {
        loop {
            let event = sub.recv().await.expect("bus open");
            if let Payload::Synthesis(increment) = event.payload {
                return increment;
            }
        }
    }

    fn spawn_stage(
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> (EventBus, SessionId, Subscription, CancellationToken) {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let synthesis_sub = bus.subscribe(Topic::Synthesis, "test");
        let cancel = CancellationToken::new();
        tokio::spawn(run_synthesis(
            bus.clone(),
            session,
            SynthesisConfig::default(),
            synthesizer,
            cancel.clone(),
        ));
        (bus, session, synthesis_sub, cancel)
    }

    #[tokio::test]
    async fn batches_text_and_emits_ordered_increments() {
        let synthesizer = ScriptedSynthesizer::always_ok();
        let (bus, session, mut synthesis_sub, cancel) = spawn_stage(synthesizer.clone());

        bus.emit(session, response(1, "It is ", 0, false)).await;
        bus.emit(session, response(1, "noon. More to come", 1, false))
            .await;
        bus.emit(session, response(1, "", 2, true)).await;

        let first = recv_synthesis(&mut synthesis_sub).await;
        let second = recv_synthesis(&mut synthesis_sub).await;
        let terminal = recv_synthesis(&mut synthesis_sub).await;

        assert_eq!(first.sequence, 0);
        assert_eq!(first.audio.as_ref(), b"pcm:It is noon.");
        assert_eq!(second.sequence, 1);
        assert_eq!(second.audio.as_ref(), b"pcm:More to come");
        assert!(terminal.is_final && !terminal.cancelled);
        assert_eq!(terminal.sequence, 2);
        assert_eq!(synthesizer.calls(), vec!["It is noon.", "More to come"]);

        cancel.cancel();
    }

    #[tokio::test]
    async fn turn_without_speakable_text_still_terminates() {
        let synthesizer = ScriptedSynthesizer::always_ok();
        let (bus, session, mut synthesis_sub, cancel) = spawn_stage(synthesizer.clone());

        bus.emit(session, response(1, "", 0, true)).await;

        let terminal = recv_synthesis(&mut synthesis_sub).await;
        assert!(terminal.is_final && !terminal.cancelled);
        assert_eq!(terminal.sequence, 0);
        assert!(synthesizer.calls().is_empty());

        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_mid_call_abandons_and_terminates() {
        let (bus, session, mut synthesis_sub, cancel) = spawn_stage(Arc::new(HangingSynthesizer));

        bus.emit(session, response(1, "A sentence long enough to batch.", 0, false))
            .await;
        // Give the hanging call a moment to start, then cancel the turn.
        tokio::task::yield_now().await;
        bus.emit(
            session,
            Payload::TurnCancelled {
                turn: TurnId::new(1),
                reason: CancelReason::BargeIn,
            },
        )
        .await;

        let terminal = recv_synthesis(&mut synthesis_sub).await;
        assert!(terminal.is_final && terminal.cancelled);
        assert_eq!(terminal.sequence, 0);

        // Late fragments for the closed turn are dropped.
        bus.emit(session, response(1, "more.", 1, true)).await;
        let quiet =
            tokio::time::timeout(Duration::from_millis(50), synthesis_sub.recv()).await;
        assert!(quiet.is_err());

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn outage_reports_unavailable_skips_rest_and_recovers() {
        let synthesizer = ScriptedSynthesizer::with_script(vec![false, false, false]);
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut synthesis_sub = bus.subscribe(Topic::Synthesis, "test");
        let mut control_sub = bus.subscribe(Topic::Control, "test");
        let cancel = CancellationToken::new();
        tokio::spawn(run_synthesis(
            bus.clone(),
            session,
            SynthesisConfig::default(),
            synthesizer.clone(),
            cancel.clone(),
        ));

        // Two batches in one fragment: the first exhausts its retries, the
        // second is dropped while the stage is marked unavailable.
        bus.emit(
            session,
            response(1, "One full sentence here. Another full sentence.", 0, false),
        )
        .await;
        bus.emit(session, response(1, "", 1, true)).await;

        let event = control_sub.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            Payload::StreamUnavailable {
                stage: Stage::Synthesis,
                ..
            }
        ));
        let terminal = recv_synthesis(&mut synthesis_sub).await;
        assert!(terminal.is_final && !terminal.cancelled);
        assert_eq!(terminal.sequence, 0);
        assert_eq!(synthesizer.calls().len(), 3);

        // The next turn tries again and brings the stage back.
        bus.emit(session, response(2, "Back online now.", 0, false)).await;
        bus.emit(session, response(2, "", 1, true)).await;

        let audio = recv_synthesis(&mut synthesis_sub).await;
        assert_eq!(audio.audio.as_ref(), b"pcm:Back online now.");
        let terminal = recv_synthesis(&mut synthesis_sub).await;
        assert!(terminal.is_final && !terminal.cancelled);

        let event = control_sub.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            Payload::StreamRecovered {
                stage: Stage::Synthesis,
            }
        ));

        cancel.cancel();
    }
}
