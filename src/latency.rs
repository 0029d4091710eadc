//! Latency budget monitor: utterance end to first synthesized audio.
//!
//! Each turn gets one watch, armed when the controller requests generation and
//! anchored at the close of the utterance that triggered it. Crossing the soft
//! budget emits a diagnostic and nothing else; crossing the hard budget with
//! still no audio asks the controller to cancel the turn. Both fire at most
//! once per turn.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};
use crate::config::LatencyConfig;
use crate::events::{Payload, SessionId, TurnId};

/// Timing state for the turn currently awaited.
struct Watch {
    turn: TurnId,
    started: Instant,
    soft_fired: bool,
}

/// Worker: times every turn from utterance end to first audio.
pub async fn run_latency_monitor(
    bus: EventBus,
    session: SessionId,
    config: LatencyConfig,
    cancel: CancellationToken,
) {
    let mut vad_sub = bus.subscribe(Topic::Vad, "latency");
    let mut turns_sub = bus.subscribe(Topic::Turns, "latency");
    let mut synthesis_sub = bus.subscribe(Topic::Synthesis, "latency");
    info!(
        "latency monitor started (soft {} ms, hard {} ms)",
        config.soft_budget_ms, config.hard_budget_ms
    );

    let soft = Duration::from_millis(config.soft_budget_ms);
    let hard = Duration::from_millis(config.hard_budget_ms);
    // Close time of the most recent utterance, consumed by the next turn.
    let mut last_closed: Option<Instant> = None;
    let mut watch: Option<Watch> = None;

    loop {
        let deadline = watch.as_ref().map(|w| {
            if w.soft_fired {
                w.started + hard
            } else {
                w.started + soft
            }
        });

        tokio::select! {
            () = cancel.cancelled() => break,

            maybe = vad_sub.recv() => {
                let Some(event) = maybe else { break };
                if matches!(event.payload, Payload::UtteranceClosed { .. }) {
                    last_closed = Some(Instant::now());
                }
            }

            maybe = turns_sub.recv() => {
                let Some(event) = maybe else { break };
                match event.payload {
                    Payload::GenerationRequested(request) => {
                        let started = last_closed.take().unwrap_or_else(Instant::now);
                        watch = Some(Watch {
                            turn: request.turn,
                            started,
                            soft_fired: false,
                        });
                    }
                    Payload::TurnCancelled { turn, .. } | Payload::TurnCompleted { turn } => {
                        if watch.as_ref().is_some_and(|w| w.turn == turn) {
                            watch = None;
                        }
                    }
                    _ => {}
                }
            }

            maybe = synthesis_sub.recv() => {
                let Some(event) = maybe else { break };
                let Payload::Synthesis(increment) = event.payload else { continue };
                let Some(w) = watch.as_ref() else { continue };
                if w.turn != increment.turn {
                    continue;
                }
                let (started, soft_fired) = (w.started, w.soft_fired);
                if increment.is_final {
                    // The turn ended without audible output; nothing to time.
                    watch = None;
                    continue;
                }
                let elapsed = started.elapsed();
                if !soft_fired && elapsed > soft {
                    warn!(
                        "first audio for turn {} after {} ms, over the {} ms soft budget",
                        increment.turn,
                        elapsed.as_millis(),
                        config.soft_budget_ms
                    );
                    bus.emit(session, Payload::LatencyBudgetExceeded {
                        turn: increment.turn,
                        elapsed_ms: elapsed.as_millis() as u64,
                        budget_ms: config.soft_budget_ms,
                    })
                    .await;
                } else {
                    debug!(
                        "first audio for turn {} after {} ms",
                        increment.turn,
                        elapsed.as_millis()
                    );
                }
                watch = None;
            }

            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let Some(mut w) = watch.take() else { continue };
                let elapsed_ms = w.started.elapsed().as_millis() as u64;
                if !w.soft_fired {
                    w.soft_fired = true;
                    let turn = w.turn;
                    watch = Some(w);
                    warn!("turn {turn} over the soft latency budget after {elapsed_ms} ms");
                    bus.emit(session, Payload::LatencyBudgetExceeded {
                        turn,
                        elapsed_ms,
                        budget_ms: config.soft_budget_ms,
                    })
                    .await;
                } else {
                    error!(
                        "turn {} over the hard latency budget after {elapsed_ms} ms; requesting cancellation",
                        w.turn
                    );
                    bus.emit(session, Payload::DeadlineExceeded {
                        turn: w.turn,
                        elapsed_ms,
                    })
                    .await;
                }
            }
        }
    }
    debug!("latency monitor stopped");
}
