//! Session assembly: one bus, one worker per stage, one shutdown token.
//!
//! [`Orchestrator::run`] owns a session end to end. It creates the event bus,
//! spawns every stage worker against it, and unwinds them all when the
//! session ends or [`Orchestrator::shutdown`] is called. Embedders push raw
//! capture buffers into the sender from [`Orchestrator::capture_sender`] and
//! receive synthesized audio through their [`PlaybackSink`].

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::audio::run_ingest;
use crate::bridge::run_bridge;
use crate::bus::{EventBus, Subscription, Topic};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::events::{Payload, SessionId};
use crate::generation::{GenerationClient, OpenAiGenerationClient, run_generation};
use crate::latency::run_latency_monitor;
use crate::playback::{NoopSink, PlaybackSink, run_playback_feed};
use crate::stt::{TranscriptionConnector, WsTranscriptionConnector, run_stt};
use crate::synthesis::{HttpSynthesizer, SpeechSynthesizer, run_synthesis};
use crate::turn::run_turns;

/// Capture buffers queued between the embedder and the ingest worker.
const CAPTURE_CHANNEL_SIZE: usize = 32;

/// External service boundaries for one session.
///
/// The stock set talks to the configured HTTP and WebSocket endpoints; tests
/// and embedders swap in their own implementations per seam.
pub struct Services {
    /// Streaming transcription connection factory.
    pub transcription: Arc<dyn TranscriptionConnector>,
    /// Streaming text generation client.
    pub generation: Arc<dyn GenerationClient>,
    /// Text-to-speech client.
    pub synthesis: Arc<dyn SpeechSynthesizer>,
    /// Destination for synthesized audio.
    pub playback: Arc<dyn PlaybackSink>,
}

impl Services {
    /// Service clients for the configured endpoints, with a [`NoopSink`] for
    /// playback. Embedders that play audio locally supply their own sink via
    /// [`Services::with_playback`].
    ///
    /// # Errors
    /// Returns an error when an endpoint cannot be parsed or an HTTP client
    /// cannot be built.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            transcription: Arc::new(WsTranscriptionConnector::new(&config.stt, &config.audio)?),
            generation: Arc::new(OpenAiGenerationClient::new(&config.generation)?),
            synthesis: Arc::new(HttpSynthesizer::new(config.synthesis.clone())?),
            playback: Arc::new(NoopSink),
        })
    }

    /// Replace the playback sink.
    #[must_use]
    pub fn with_playback(mut self, sink: Arc<dyn PlaybackSink>) -> Self {
        self.playback = sink;
        self
    }
}

/// Owns one conversational session.
pub struct Orchestrator {
    config: OrchestratorConfig,
    services: Services,
    bus: EventBus,
    session: SessionId,
    cancel: CancellationToken,
    capture_tx: mpsc::Sender<Vec<i16>>,
    capture_rx: mpsc::Receiver<Vec<i16>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: OrchestratorConfig, services: Services) -> Self {
        let bus = EventBus::new(config.bus.clone());
        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_CHANNEL_SIZE);
        Self {
            config,
            services,
            bus,
            session: SessionId::new(),
            cancel: CancellationToken::new(),
            capture_tx,
            capture_rx,
        }
    }

    /// Sender for raw capture buffers; clone freely. The session ends once
    /// every sender is dropped (including the bridge's, when enabled).
    #[must_use]
    pub fn capture_sender(&self) -> mpsc::Sender<Vec<i16>> {
        self.capture_tx.clone()
    }

    /// Observe session traffic on one topic. Subscriptions taken before
    /// [`Orchestrator::run`] see every event the session publishes.
    #[must_use]
    pub fn subscribe(&self, topic: Topic, name: &str) -> Subscription {
        self.bus.subscribe(topic, name)
    }

    /// Identifier stamped on every event this session publishes.
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Request orderly shutdown. [`Orchestrator::run`] returns once every
    /// worker has unwound.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled when the session ends, for embedders that tie other
    /// tasks to the session lifetime.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session to completion: until the capture channel closes, the
    /// playback sink fails, or `shutdown` is called.
    ///
    /// # Errors
    /// Currently always returns `Ok`; fatal conditions end the session
    /// through [`Payload::SessionEnded`] rather than an early return.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            services,
            bus,
            session,
            cancel,
            capture_tx,
            capture_rx,
        } = self;
        let started = Instant::now();
        info!("session {session} starting");

        // Subscribed before any worker runs so no session end can be missed.
        let end_watch = {
            let mut control = bus.subscribe(Topic::Control, "session-end");
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        event = control.recv() => match event {
                            Some(event) => {
                                if let Payload::SessionEnded { reason } = event.payload {
                                    info!("session ending ({reason:?})");
                                    cancel.cancel();
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            })
        };

        // Consolidated journal of health signals; each source also logs its
        // own failures at the point of detection.
        let diagnostics = bus.attach(Topic::Diagnostics, "diagnostics-log", |event| async move {
            match event.payload {
                Payload::NoSignalWarning { zero_chunks } => {
                    debug!("journal: no capture signal for {zero_chunks} chunks");
                }
                Payload::DataLoss { stage, dropped } => {
                    debug!("journal: {stage} dropped {dropped} items during an outage");
                }
                Payload::HandlerFault {
                    topic,
                    subscriber,
                    detail,
                } => {
                    debug!("journal: handler '{subscriber}' on {topic} faulted: {detail}");
                }
                Payload::LatencyBudgetExceeded {
                    turn,
                    elapsed_ms,
                    budget_ms,
                } => {
                    debug!("journal: turn {turn} at {elapsed_ms} ms of a {budget_ms} ms budget");
                }
                _ => {}
            }
            Ok(())
        });

        let ingest = {
            let bus = bus.clone();
            let audio = config.audio.clone();
            let vad = config.vad.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_ingest(bus, session, audio, vad, capture_rx, cancel).await;
            })
        };

        let stt = {
            let bus = bus.clone();
            let stt_config = config.stt.clone();
            let connector = Arc::clone(&services.transcription);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_stt(bus, session, stt_config, connector, cancel).await;
            })
        };

        let turns = {
            let bus = bus.clone();
            let turn_config = config.turn.clone();
            let chunk_ms = config.audio.chunk_ms;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_turns(bus, session, turn_config, chunk_ms, cancel).await;
            })
        };

        let generation = {
            let bus = bus.clone();
            let generation_config = config.generation.clone();
            let client = Arc::clone(&services.generation);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_generation(bus, session, generation_config, client, cancel).await;
            })
        };

        let synthesis = {
            let bus = bus.clone();
            let synthesis_config = config.synthesis.clone();
            let synthesizer = Arc::clone(&services.synthesis);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_synthesis(bus, session, synthesis_config, synthesizer, cancel).await;
            })
        };

        let playback = {
            let bus = bus.clone();
            let sink = Arc::clone(&services.playback);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_playback_feed(bus, session, sink, cancel).await;
            })
        };

        let latency = {
            let bus = bus.clone();
            let latency_config = config.latency.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_latency_monitor(bus, session, latency_config, cancel).await;
            })
        };

        let bridge = if config.bridge.enabled {
            let bus = bus.clone();
            let bridge_config = config.bridge.clone();
            let capture_tx = capture_tx.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(error) = run_bridge(bus, session, bridge_config, capture_tx, cancel).await
                {
                    error!("operator bridge failed: {error}");
                }
            }))
        } else {
            None
        };
        // This copy would otherwise hold the capture channel open after the
        // embedder drops its senders.
        drop(capture_tx);

        cancel.cancelled().await;
        info!(
            "session {session} shutting down after {:?}",
            started.elapsed()
        );
        bus.close();

        if let Some(bridge) = bridge {
            let _ = bridge.await;
        }
        let _ = tokio::join!(
            ingest,
            stt,
            turns,
            generation,
            synthesis,
            playback,
            latency,
            end_watch,
            diagnostics,
        );

        info!("session {session} ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::error::OrchestratorError;
    use crate::events::GenerationRequest;
    use crate::generation::FragmentStream;
    use crate::stt::TranscriptionLink;

    struct OfflineConnector;

    #[async_trait]
    impl TranscriptionConnector for OfflineConnector {
        async fn connect(&self, _session: SessionId) -> Result<TranscriptionLink> {
            Err(OrchestratorError::Transcription("offline".into()))
        }

        async fn ready(&self) -> bool {
            false
        }
    }

    struct OfflineGeneration;

    #[async_trait]
    impl GenerationClient for OfflineGeneration {
        async fn stream(&self, _request: &GenerationRequest) -> Result<FragmentStream> {
            Err(OrchestratorError::Generation("offline".into()))
        }
    }

    struct SilentSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for SilentSynthesizer {
        async fn synthesize(&self, _text: &str) -> Result<Bytes> {
            Ok(Bytes::new())
        }
    }

    fn offline_services() -> Services {
        Services {
            transcription: Arc::new(OfflineConnector),
            generation: Arc::new(OfflineGeneration),
            synthesis: Arc::new(SilentSynthesizer),
            playback: Arc::new(NoopSink),
        }
    }

    #[test]
    fn default_config_builds_service_clients() {
        Services::from_config(&OrchestratorConfig::default()).unwrap();
    }

    #[tokio::test]
    async fn dropping_every_capture_sender_ends_the_session() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), offline_services());
        let sender = orchestrator.capture_sender();
        let run = tokio::spawn(orchestrator.run());

        drop(sender);
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("session should end on its own")
            .expect("worker panicked")
            .expect("run failed");
    }

    #[tokio::test]
    async fn shutdown_unwinds_an_idle_session() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), offline_services());
        let _keep_capture_open = orchestrator.capture_sender();
        let cancel = orchestrator.cancel_token();
        let run = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("session should end on shutdown")
            .expect("worker panicked")
            .expect("run failed");
    }

    #[tokio::test]
    async fn shutdown_also_stops_an_enabled_bridge() {
        let mut config = OrchestratorConfig::default();
        config.bridge.enabled = true;
        config.bridge.bind = "127.0.0.1:0".into();

        let orchestrator = Orchestrator::new(config, offline_services());
        let _keep_capture_open = orchestrator.capture_sender();
        let cancel = orchestrator.cancel_token();
        let run = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("session should end on shutdown")
            .expect("worker panicked")
            .expect("run failed");
    }
}
