//! Response generation: turns dialogue context into streamed text.
//!
//! The coordinator consumes `GenerationRequested` events, opens one streaming
//! completion per turn, and republishes every fragment as a tagged
//! `ResponseIncrement`. Each observed turn receives exactly one terminal
//! increment, whether the stream completed, failed, or was cancelled by the
//! controller mid-flight.

pub mod client;
pub mod sse;

pub use client::{FragmentStream, GenerationClient, OpenAiGenerationClient};

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription, Topic};
use crate::config::GenerationConfig;
use crate::events::{GenerationRequest, Payload, ResponseIncrement, SessionId, Stage, TurnId};

/// Exponential backoff with up to 25% jitter, doubling per attempt.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.clamp(1, 10) - 1;
    let delay = base_ms.saturating_mul(1 << shift);
    let jitter = rand::thread_rng().gen_range(0..=delay / 4);
    Duration::from_millis(delay + jitter)
}

/// Worker: one streaming completion at a time, driven by the turns topic.
pub async fn run_generation(
    bus: EventBus,
    session: SessionId,
    config: GenerationConfig,
    client: Arc<dyn GenerationClient>,
    cancel: CancellationToken,
) {
    let mut turns_sub = bus.subscribe(Topic::Turns, "generation");
    info!(
        "generation coordinator started ({} at {})",
        config.model, config.endpoint
    );
    // Set while the stage has an unresolved StreamUnavailable outstanding.
    let mut failed = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe = turns_sub.recv() => {
                let Some(event) = maybe else { break };
                let Payload::GenerationRequested(request) = event.payload else { continue };
                stream_turn(
                    &bus,
                    session,
                    &config,
                    client.as_ref(),
                    &request,
                    &mut turns_sub,
                    &cancel,
                    &mut failed,
                )
                .await;
            }
        }
    }
    debug!("generation coordinator stopped");
}

/// Run one turn end to end: connect with retries, relay fragments, and close
/// with exactly one terminal increment.
#[allow(clippy::too_many_arguments)]
async fn stream_turn(
    bus: &EventBus,
    session: SessionId,
    config: &GenerationConfig,
    client: &dyn GenerationClient,
    request: &GenerationRequest,
    turns_sub: &mut Subscription,
    cancel: &CancellationToken,
    failed: &mut bool,
) {
    let turn = request.turn;
    let mut sequence: u32 = 0;

    let mut attempt: u32 = 1;
    let mut stream = loop {
        match client.stream(request).await {
            Ok(stream) => break stream,
            Err(e) if attempt < config.connect_attempts => {
                let delay = backoff_delay(config.backoff_base_ms, attempt);
                warn!("generation connect attempt {attempt} failed: {e}; retrying in {delay:?}");
                attempt += 1;
                if backoff_wait(turns_sub, turn, delay, cancel).await {
                    publish_terminal(bus, session, turn, sequence, true).await;
                    return;
                }
            }
            Err(e) => {
                warn!("generation unavailable after {attempt} attempts: {e}");
                if !*failed {
                    *failed = true;
                    bus.emit(
                        session,
                        Payload::StreamUnavailable {
                            stage: Stage::Generation,
                            detail: e.to_string(),
                        },
                    )
                    .await;
                }
                publish_terminal(bus, session, turn, sequence, false).await;
                return;
            }
        }
    };

    debug!("generation stream opened for turn {turn}");
    if *failed {
        *failed = false;
        bus.emit(
            session,
            Payload::StreamRecovered {
                stage: Stage::Generation,
            },
        )
        .await;
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                publish_terminal(bus, session, turn, sequence, true).await;
                return;
            }

            maybe = turns_sub.recv() => {
                let Some(event) = maybe else {
                    publish_terminal(bus, session, turn, sequence, true).await;
                    return;
                };
                if matches!(event.payload, Payload::TurnCancelled { turn: t, .. } if t == turn) {
                    info!("generation for turn {turn} cancelled after {sequence} fragments");
                    // Dropping the stream closes the upstream connection.
                    drop(stream);
                    publish_terminal(bus, session, turn, sequence, true).await;
                    return;
                }
            }

            fragment = stream.next() => {
                match fragment {
                    Some(Ok(text)) => {
                        bus.emit(
                            session,
                            Payload::Response(ResponseIncrement {
                                turn,
                                text,
                                sequence,
                                is_final: false,
                                cancelled: false,
                            }),
                        )
                        .await;
                        sequence += 1;
                    }
                    Some(Err(e)) => {
                        warn!("generation stream for turn {turn} broke: {e}");
                        if !*failed {
                            *failed = true;
                            bus.emit(
                                session,
                                Payload::StreamUnavailable {
                                    stage: Stage::Generation,
                                    detail: e.to_string(),
                                },
                            )
                            .await;
                        }
                        publish_terminal(bus, session, turn, sequence, false).await;
                        return;
                    }
                    None => {
                        info!("generation for turn {turn} complete ({sequence} fragments)");
                        publish_terminal(bus, session, turn, sequence, false).await;
                        return;
                    }
                }
            }
        }
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

async fn publish_terminal(
    bus: &EventBus,
    session: SessionId,
    turn: TurnId,
    sequence: u32,
    cancelled: bool,
) {
    bus.emit(
        session,
        Payload::Response(ResponseIncrement {
            turn,
            text: String::new(),
            sequence,
            is_final: true,
            cancelled,
        }),
    )
    .await;
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

    enum Outcome {
        Refuse,
        Fragments(Vec<&'static str>),
        FragmentsThenHang(Vec<&'static str>),
        FragmentsThenError(Vec<&'static str>),
    }

    struct ScriptedClient {
        outcomes: Mutex<VecDeque<Outcome>>,
    }

    impl ScriptedClient {
        fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedClient {
        async fn stream(&self, _request: &GenerationRequest) -> crate::Result<FragmentStream> {
            match self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Outcome::Refuse)
            {
                Outcome::Refuse => Err(OrchestratorError::Generation("scripted refusal".into())),
                Outcome::Fragments(parts) => Ok(Box::pin(futures_util::stream::iter(
                    parts.into_iter().map(|p| Ok(p.to_owned())),
                ))),
                Outcome::FragmentsThenHang(parts) => Ok(Box::pin(async_stream::stream! {
                    for p in parts {
                        yield Ok(p.to_owned());
                    }
                    std::future::pending::<()>().await;
                })),
                Outcome::FragmentsThenError(parts) => Ok(Box::pin(async_stream::stream! {
                    for p in parts {
                        yield Ok(p.to_owned());
                    }
                    yield Err(OrchestratorError::Generation("mid-stream break".into()));
                })),
            }
        }
    }

    fn request(turn: u64) -> Payload {
        Payload::GenerationRequested(GenerationRequest {
            turn: TurnId::new(turn),
            context: Vec::new(),
        })
    }

    async fn recv_response(sub: &mut Subscription) -> ResponseIncrement {
        loop {
            let event = sub.recv().await.expect("bus open");
            if let Payload::Response(increment) = event.payload {
                return increment;
            }
        }
    }

    #[tokio::test]
    async fn fragments_arrive_in_order_with_one_terminal() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut responses = bus.subscribe(Topic::Responses, "test");
        let cancel = CancellationToken::new();
        tokio::spawn(run_generation(
            bus.clone(),
            session,
            GenerationConfig::default(),
            ScriptedClient::new(vec![Outcome::Fragments(vec!["Hel", "lo"])]),
            cancel.clone(),
        ));

        bus.emit(session, request(1)).await;

        let first = recv_response(&mut responses).await;
        let second = recv_response(&mut responses).await;
        let terminal = recv_response(&mut responses).await;
        assert_eq!((first.sequence, first.text.as_str()), (0, "Hel"));
        assert_eq!((second.sequence, second.text.as_str()), (1, "lo"));
        assert!(terminal.is_final && !terminal.cancelled);
        assert_eq!(terminal.sequence, 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_mid_stream_emits_cancelled_terminal() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut responses = bus.subscribe(Topic::Responses, "test");
        let cancel = CancellationToken::new();
        tokio::spawn(run_generation(
            bus.clone(),
            session,
            GenerationConfig::default(),
            ScriptedClient::new(vec![Outcome::FragmentsThenHang(vec!["part"])]),
            cancel.clone(),
        ));

        bus.emit(session, request(1)).await;
        let first = recv_response(&mut responses).await;
        assert_eq!(first.text, "part");

        bus.emit(
            session,
            Payload::TurnCancelled {
                turn: TurnId::new(1),
                reason: CancelReason::BargeIn,
            },
        )
        .await;

        let terminal = recv_response(&mut responses).await;
        assert!(terminal.is_final && terminal.cancelled);

        // Nothing follows the terminal.
        let quiet =
            tokio::time::timeout(Duration::from_millis(50), responses.recv()).await;
        assert!(quiet.is_err());

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_unavailable_and_terminate() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut responses = bus.subscribe(Topic::Responses, "test");
        let mut control = bus.subscribe(Topic::Control, "test");
        let cancel = CancellationToken::new();
        tokio::spawn(run_generation(
            bus.clone(),
            session,
            GenerationConfig::default(),
            ScriptedClient::new(vec![]),
            cancel.clone(),
        ));

        bus.emit(session, request(1)).await;

        let event = control.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            Payload::StreamUnavailable {
                stage: Stage::Generation,
                ..
            }
        ));

        let terminal = recv_response(&mut responses).await;
        assert!(terminal.is_final && !terminal.cancelled);
        assert_eq!(terminal.sequence, 0);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failure_reports_recovery() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut responses = bus.subscribe(Topic::Responses, "test");
        let mut control = bus.subscribe(Topic::Control, "test");
        let cancel = CancellationToken::new();
        tokio::spawn(run_generation(
            bus.clone(),
            session,
            GenerationConfig::default(),
            ScriptedClient::new(vec![
                Outcome::Refuse,
                Outcome::Refuse,
                Outcome::Refuse,
                Outcome::Fragments(vec!["back"]),
            ]),
            cancel.clone(),
        ));

        bus.emit(session, request(1)).await;
        let terminal = recv_response(&mut responses).await;
        assert!(terminal.is_final);

        bus.emit(session, request(2)).await;
        let fragment = recv_response(&mut responses).await;
        assert_eq!(fragment.text, "back");

        let mut stages = Vec::new();
        for _ in 0..2 {
            match control.recv().await.unwrap().payload {
                Payload::StreamUnavailable { stage, .. } => stages.push(("down", stage)),
                Payload::StreamRecovered { stage } => stages.push(("up", stage)),
                other => panic!("unexpected control payload: {other:?}"),
            }
        }
        assert_eq!(
            stages,
            vec![("down", Stage::Generation), ("up", Stage::Generation)]
        );

        cancel.cancel();
    }

    #[tokio::test]
    async fn mid_stream_failure_terminates_plainly() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut responses = bus.subscribe(Topic::Responses, "test");
        let mut control = bus.subscribe(Topic::Control, "test");
        let cancel = CancellationToken::new();
        tokio::spawn(run_generation(
            bus.clone(),
            session,
            GenerationConfig::default(),
            ScriptedClient::new(vec![Outcome::FragmentsThenError(vec!["half an ans"])]),
            cancel.clone(),
        ));

        bus.emit(session, request(1)).await;
        let fragment = recv_response(&mut responses).await;
        assert_eq!(fragment.text, "half an ans");

        let terminal = recv_response(&mut responses).await;
        assert!(terminal.is_final && !terminal.cancelled);

        let event = control.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            Payload::StreamUnavailable {
                stage: Stage::Generation,
                ..
            }
        ));

        cancel.cancel();
    }
}
