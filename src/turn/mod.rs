//! Turn-taking: who speaks when.
//!
//! The controller owns the session's conversational state and the one-turn-
//! in-flight invariant. All decisions live in the pure [`TurnEngine`]; the
//! worker here is a thin pump that feeds it bus events and publishes the
//! effects it returns.

pub mod context;
pub mod engine;

pub use context::ContextWindow;
pub use engine::TurnEngine;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{EventBus, Topic};
use crate::config::TurnConfig;
use crate::events::{Payload, SessionId};

/// Worker: applies every relevant bus event to the turn engine.
///
/// `chunk_ms` is the capture chunk duration, used to interpret the running
/// counts in no-signal diagnostics.
pub async fn run_turns(
    bus: EventBus,
    session: SessionId,
    config: TurnConfig,
    chunk_ms: u32,
    cancel: CancellationToken,
) {
    let mut transcripts = bus.subscribe(Topic::Transcripts, "turn-controller");
    let mut vad = bus.subscribe(Topic::Vad, "turn-controller");
    let mut responses = bus.subscribe(Topic::Responses, "turn-controller");
    let mut synthesis = bus.subscribe(Topic::Synthesis, "turn-controller");
    let mut control = bus.subscribe(Topic::Control, "turn-controller");
    let mut diagnostics = bus.subscribe(Topic::Diagnostics, "turn-controller");

    let mut engine = TurnEngine::new(config, chunk_ms);
    info!("turn controller started");

    loop {
        let maybe = tokio::select! {
            () = cancel.cancelled() => break,
            maybe = transcripts.recv() => maybe,
            maybe = vad.recv() => maybe,
            maybe = responses.recv() => maybe,
            maybe = synthesis.recv() => maybe,
            maybe = control.recv() => maybe,
            maybe = diagnostics.recv() => maybe,
        };
        let Some(event) = maybe else { break };
        let ended = matches!(event.payload, Payload::SessionEnded { .. });
        for effect in engine.handle(&event.payload) {
            bus.emit(session, effect).await;
        }
        if ended {
            break;
        }
    }
    debug!("turn controller stopped");
}
