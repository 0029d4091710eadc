//! Playback feed: delivers synthesized audio to the embedder's sink.
//!
//! The feed sits between the bus and the [`PlaybackSink`] collaborator. It
//! forwards `SynthesisIncrement`s in publish order, drops increments for turns
//! the controller has discarded, and translates `PlaybackDiscard` into the
//! sink's flush operation. A sink failure ends the session; there is nowhere
//! left to play audio.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::{EventBus, Topic};
use crate::error::Result;
use crate::events::{EndReason, Payload, SessionId, SynthesisIncrement, TurnId};

/// Where synthesized audio goes.
///
/// Increments arrive in sequence order per turn; the terminal increment
/// carries no audio and marks the turn's end. `discard_queued` drops anything
/// buffered but unplayed for the turn.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn enqueue(&self, increment: SynthesisIncrement) -> Result<()>;
    async fn discard_queued(&self, turn: TurnId) -> Result<()>;
}

/// Sink for embedders that deliver audio elsewhere, such as over the operator
/// bridge.
pub struct NoopSink;

#[async_trait]
impl PlaybackSink for NoopSink {
    async fn enqueue(&self, _increment: SynthesisIncrement) -> Result<()> {
        Ok(())
    }

    async fn discard_queued(&self, _turn: TurnId) -> Result<()> {
        Ok(())
    }
}

/// Worker: feeds the playback sink from the synthesis topic.
pub async fn run_playback_feed(
    bus: EventBus,
    session: SessionId,
    sink: Arc<dyn PlaybackSink>,
    cancel: CancellationToken,
) {
    let mut synthesis_sub = bus.subscribe(Topic::Synthesis, "playback-feed");
    let mut playback_sub = bus.subscribe(Topic::Playback, "playback-feed");
    info!("playback feed started");

    // Turns whose remaining increments must not reach the sink.
    let mut discarded: HashSet<TurnId> = HashSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            maybe = playback_sub.recv() => {
                let Some(event) = maybe else { break };
                let Payload::PlaybackDiscard { turn } = event.payload else { continue };
                debug!("discarding queued audio for turn {turn}");
                discarded.insert(turn);
                if let Err(e) = sink.discard_queued(turn).await {
                    error!("playback sink failed discarding turn {turn}: {e}");
                    bus.emit(session, Payload::SessionEnded { reason: EndReason::PlaybackFailed })
                        .await;
                    break;
                }
            }

            maybe = synthesis_sub.recv() => {
                let Some(event) = maybe else { break };
                let Payload::Synthesis(increment) = event.payload else { continue };
                let turn = increment.turn;
                let is_final = increment.is_final;
                if discarded.contains(&turn) {
                    if is_final {
                        // The turn is over; stop tracking it. Ids never recur.
                        discarded.retain(|&id| id > turn);
                    }
                    continue;
                }
                if let Err(e) = sink.enqueue(increment).await {
                    error!("playback sink failed on turn {turn}: {e}");
                    bus.emit(session, Payload::SessionEnded { reason: EndReason::PlaybackFailed })
                        .await;
                    break;
                }
                if is_final {
                    discarded.retain(|&id| id > turn);
                }
            }
        }
    }
    debug!("playback feed stopped");
}
