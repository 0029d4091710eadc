//! STT session management: one streaming transcription link per session.
//!
//! The manager connects lazily when the first audio chunk arrives, feeds
//! chunks in arrival order, forwards end-of-utterance marks from the
//! segmenter, and republishes wire transcripts tagged with the segmenter's
//! utterance ids so transcripts and barge-in signals share one id space.
//! On connection loss it retries with bounded exponential backoff while
//! buffering a capped window of audio; once the budget is exhausted it
//! reports the stream unavailable and falls back to periodic health probes.

pub mod transport;

pub use transport::{
    AudioFrame, LinkEvent, TranscriptionConnector, TranscriptionLink, WireTranscript,
    WsTranscriptionConnector, pcm_bytes,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};
use crate::config::SttConfig;
use crate::events::{AudioChunk, Payload, SessionId, Stage, Transcript, UtteranceId};

/// Exponential backoff with up to 25% jitter, doubling per attempt.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.clamp(1, 10) - 1;
    let delay = base_ms.saturating_mul(1 << shift);
    let jitter = rand::thread_rng().gen_range(0..=delay / 4);
    Duration::from_millis(delay + jitter)
}

#[derive(Clone, Copy)]
enum LinkPhase {
    /// No link yet; connect on the first audio chunk.
    Idle,
    /// Waiting to make reconnect attempt `attempt`.
    Backoff { attempt: u32, resume_at: Instant },
    /// Retry budget exhausted; probing for recovery.
    Probing { next_probe_at: Instant },
}

struct SttManager {
    bus: EventBus,
    session: SessionId,
    config: SttConfig,
    connector: Arc<dyn TranscriptionConnector>,
    buffer: VecDeque<AudioChunk>,
    buffered_ms: u32,
    dropped_in_outage: u64,
    unavailable_reported: bool,
    current_utterance: Option<UtteranceId>,
    recent_utterance: Option<UtteranceId>,
    transcript_seq: u32,
}

impl SttManager {
    fn note_opened(&mut self, utterance: UtteranceId) {
        self.current_utterance = Some(utterance);
        self.transcript_seq = 0;
    }

    fn note_closed(&mut self, utterance: UtteranceId) {
        self.recent_utterance = Some(utterance);
        if self.current_utterance == Some(utterance) {
            self.current_utterance = None;
        }
    }

    /// Buffer a chunk while disconnected, dropping from the front once the
    /// window is full.
    fn buffer_chunk(&mut self, chunk: AudioChunk) {
        self.buffered_ms += chunk.duration_ms();
        self.buffer.push_back(chunk);
        while self.buffered_ms > self.config.buffer_ms && self.buffer.len() > 1 {
            if let Some(old) = self.buffer.pop_front() {
                self.buffered_ms -= old.duration_ms();
                self.dropped_in_outage += 1;
            }
        }
    }

    async fn flush_into(&mut self, link: &TranscriptionLink) -> bool {
        while let Some(chunk) = self.buffer.pop_front() {
            self.buffered_ms -= chunk.duration_ms();
            let frame = AudioFrame::Pcm(pcm_bytes(&chunk.samples));
            if link.audio_tx.send(frame).await.is_err() {
                return false;
            }
        }
        true
    }

    /// One connect attempt; on success the outage bookkeeping is resolved and
    /// any buffered audio is flushed.
    async fn try_connect(&mut self) -> Option<TranscriptionLink> {
        match self.connector.connect(self.session).await {
            Ok(link) => {
                self.report_data_loss().await;
                if !self.flush_into(&link).await {
                    warn!("transcription link died during buffered audio flush");
                    return None;
                }
                if self.unavailable_reported {
                    self.unavailable_reported = false;
                    info!("transcription stream recovered");
                    self.bus
                        .emit(
                            self.session,
                            Payload::StreamRecovered {
                                stage: Stage::Transcription,
                            },
                        )
                        .await;
                }
                Some(link)
            }
            Err(e) => {
                warn!("transcription connect failed: {e}");
                None
            }
        }
    }

    fn begin_backoff(&self, attempt: u32) -> LinkPhase {
        let delay = backoff_delay(self.config.backoff_base_ms, attempt);
        debug!("transcription reconnect attempt {attempt} in {delay:?}");
        LinkPhase::Backoff {
            attempt,
            resume_at: Instant::now() + delay,
        }
    }

    fn begin_probing(&self) -> LinkPhase {
        LinkPhase::Probing {
            next_probe_at: Instant::now() + Duration::from_millis(self.config.probe_interval_ms),
        }
    }

    async fn report_unavailable(&mut self, detail: &str) {
        if self.unavailable_reported {
            return;
        }
        self.unavailable_reported = true;
        error!("transcription stream unavailable: {detail}");
        self.bus
            .emit(
                self.session,
                Payload::StreamUnavailable {
                    stage: Stage::Transcription,
                    detail: detail.to_owned(),
                },
            )
            .await;
    }

    /// Summarize buffered-audio drops for the outage that just resolved.
    async fn report_data_loss(&mut self) {
        if self.dropped_in_outage == 0 {
            return;
        }
        let dropped = self.dropped_in_outage;
        self.dropped_in_outage = 0;
        warn!("dropped {dropped} audio chunks while the transcription link was down");
        self.bus
            .emit(
                self.session,
                Payload::DataLoss {
                    stage: Stage::Transcription,
                    dropped,
                },
            )
            .await;
    }

    async fn publish_transcript(&mut self, wire: WireTranscript) {
        let Some(utterance) = self.current_utterance.or(self.recent_utterance) else {
            debug!("transcript before any utterance, dropped: {:?}", wire.text);
            return;
        };
        let sequence = self.transcript_seq;
        self.transcript_seq += 1;
        if wire.is_final {
            info!("final transcript for utterance {utterance}: {:?}", wire.text);
        }
        self.bus
            .emit(
                self.session,
                Payload::Transcript(Transcript {
                    utterance,
                    text: wire.text,
                    is_final: wire.is_final,
                    sequence,
                    at: std::time::Instant::now(),
                }),
            )
            .await;
    }
}

async fn recv_link_event(active: &mut Option<TranscriptionLink>) -> Option<LinkEvent> {
    match active.as_mut() {
        Some(link) => link.events_rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Worker: owns the transcription link lifecycle for one session.
pub async fn run_stt(
    bus: EventBus,
    session: SessionId,
    config: SttConfig,
    connector: Arc<dyn TranscriptionConnector>,
    cancel: CancellationToken,
) {
    let mut audio_sub = bus.subscribe(Topic::Audio, "stt-manager");
    let mut vad_sub = bus.subscribe(Topic::Vad, "stt-manager");
    info!("stt manager started (lazy connect to {})", config.endpoint);

    let probe_interval = Duration::from_millis(config.probe_interval_ms);
    let mut manager = SttManager {
        bus,
        session,
        config,
        connector,
        buffer: VecDeque::new(),
        buffered_ms: 0,
        dropped_in_outage: 0,
        unavailable_reported: false,
        current_utterance: None,
        recent_utterance: None,
        transcript_seq: 0,
    };
    let mut active: Option<TranscriptionLink> = None;
    let mut phase = LinkPhase::Idle;

    loop {
        let deadline = if active.is_some() {
            None
        } else {
            match phase {
                LinkPhase::Backoff { resume_at, .. } => Some(resume_at),
                LinkPhase::Probing { next_probe_at } => Some(next_probe_at),
                LinkPhase::Idle => None,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,

            maybe = audio_sub.recv() => {
                let Some(event) = maybe else { break };
                let Payload::Audio(chunk) = event.payload else { continue };
                if let Some(link) = active.as_ref() {
                    let frame = AudioFrame::Pcm(pcm_bytes(&chunk.samples));
                    if link.audio_tx.send(frame).await.is_err() {
                        warn!("transcription link lost while sending audio");
                        manager.buffer_chunk(chunk);
                        active = None;
                        phase = manager.begin_backoff(1);
                    }
                } else {
                    manager.buffer_chunk(chunk);
                    if matches!(phase, LinkPhase::Idle) {
                        match manager.try_connect().await {
                            Some(link) => active = Some(link),
                            None => phase = manager.begin_backoff(1),
                        }
                    }
                }
            }

            maybe = vad_sub.recv() => {
                let Some(event) = maybe else { break };
                match event.payload {
                    Payload::UtteranceOpened { utterance } => manager.note_opened(utterance),
                    Payload::UtteranceClosed { utterance, .. } => {
                        manager.note_closed(utterance);
                        if let Some(link) = active.as_ref()
                            && link.audio_tx.send(AudioFrame::EndOfUtterance).await.is_err()
                        {
                            warn!("transcription link lost while marking end of utterance");
                            active = None;
                            phase = manager.begin_backoff(1);
                        }
                    }
                    _ => {}
                }
            }

            maybe = recv_link_event(&mut active), if active.is_some() => {
                match maybe {
                    Some(LinkEvent::Transcript(wire)) => manager.publish_transcript(wire).await,
                    Some(LinkEvent::Closed { detail }) => {
                        warn!("transcription link closed: {detail}");
                        active = None;
                        phase = manager.begin_backoff(1);
                    }
                    None => {
                        warn!("transcription link ended without close");
                        active = None;
                        phase = manager.begin_backoff(1);
                    }
                }
            }

            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                match phase {
                    LinkPhase::Backoff { attempt, .. } => {
                        match manager.try_connect().await {
                            Some(link) => {
                                active = Some(link);
                                phase = LinkPhase::Idle;
                            }
                            None if attempt >= manager.config.connect_attempts => {
                                manager.report_unavailable("retry budget exhausted").await;
                                manager.report_data_loss().await;
                                phase = manager.begin_probing();
                            }
                            None => phase = manager.begin_backoff(attempt + 1),
                        }
                    }
                    LinkPhase::Probing { .. } => {
                        if manager.connector.ready().await
                            && let Some(link) = manager.try_connect().await
                        {
                            active = Some(link);
                            phase = LinkPhase::Idle;
                        } else {
                            phase = LinkPhase::Probing {
                                next_probe_at: Instant::now() + probe_interval,
                            };
                        }
                    }
                    LinkPhase::Idle => {}
                }
            }
        }
    }
    debug!("stt manager stopped");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::BusConfig;
    use crate::error::OrchestratorError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Instant as StdInstant;
    use tokio::sync::mpsc;

    /// Service-side handles of one accepted link.
    struct ServiceEnd {
        audio_rx: mpsc::Receiver<AudioFrame>,
        events_tx: mpsc::Sender<LinkEvent>,
    }

    /// Connector whose connect outcomes follow a script; accepted links are
    /// handed to the test through a channel.
    struct ScriptedConnector {
        script: Mutex<VecDeque<bool>>,
        ends_tx: mpsc::UnboundedSender<ServiceEnd>,
    }

    impl ScriptedConnector {
        fn new(script: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceEnd>) {
            let (ends_tx, ends_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    script: Mutex::new(script.iter().copied().collect()),
                    ends_tx,
                }),
                ends_rx,
            )
        }
    }

    #[async_trait]
    impl TranscriptionConnector for ScriptedConnector {
        async fn connect(&self, _session: SessionId) -> crate::Result<TranscriptionLink> {
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(false);
            if !ok {
                return Err(OrchestratorError::Transcription("scripted refusal".into()));
            }
            let (audio_tx, audio_rx) = mpsc::channel(64);
            let (events_tx, events_rx) = mpsc::channel(64);
            self.ends_tx
                .send(ServiceEnd { audio_rx, events_tx })
                .unwrap();
            Ok(TranscriptionLink { audio_tx, events_rx })
        }

        async fn ready(&self) -> bool {
            true
        }
    }

    fn chunk(sequence: u64, energy: f32) -> AudioChunk {
        AudioChunk {
            samples: vec![50; 1600],
            sample_rate: 16_000,
            sequence,
            captured_at: StdInstant::now(),
            energy,
        }
    }

    #[tokio::test]
    async fn connects_lazily_feeds_audio_and_tags_transcripts() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut transcripts = bus.subscribe(Topic::Transcripts, "test");
        let (connector, mut ends) = ScriptedConnector::new(&[true]);
        let cancel = CancellationToken::new();
        tokio::spawn(run_stt(
            bus.clone(),
            session,
            SttConfig::default(),
            connector,
            cancel.clone(),
        ));

        let utterance = UtteranceId::new(1);
        bus.emit(session, Payload::UtteranceOpened { utterance })
            .await;
        bus.emit(session, Payload::Audio(chunk(0, 0.05))).await;

        let mut service = ends.recv().await.unwrap();
        match service.audio_rx.recv().await.unwrap() {
            AudioFrame::Pcm(bytes) => assert_eq!(bytes.len(), 3200),
            other => panic!("unexpected frame: {other:?}"),
        }

        // Wire transcripts come back tagged with the local utterance id.
        service
            .events_tx
            .send(LinkEvent::Transcript(WireTranscript {
                text: "hello".into(),
                is_final: false,
                utterance_key: "seg-1".into(),
            }))
            .await
            .unwrap();
        service
            .events_tx
            .send(LinkEvent::Transcript(WireTranscript {
                text: "hello there".into(),
                is_final: true,
                utterance_key: "seg-1".into(),
            }))
            .await
            .unwrap();

        let first = transcripts.recv().await.unwrap();
        let second = transcripts.recv().await.unwrap();
        match (first.payload, second.payload) {
            (Payload::Transcript(a), Payload::Transcript(b)) => {
                assert_eq!(a.utterance, utterance);
                assert_eq!(a.sequence, 0);
                assert!(!a.is_final);
                assert_eq!(b.utterance, utterance);
                assert_eq!(b.sequence, 1);
                assert!(b.is_final);
                assert_eq!(b.text, "hello there");
            }
            other => panic!("unexpected payloads: {other:?}"),
        }

        // Closing the utterance sends an end-of-utterance mark.
        bus.emit(
            session,
            Payload::UtteranceClosed {
                utterance,
                voiced_ms: 300,
            },
        )
        .await;
        assert!(matches!(
            service.audio_rx.recv().await.unwrap(),
            AudioFrame::EndOfUtterance
        ));

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_quietly_within_budget_and_flushes_buffer() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut control = bus.subscribe(Topic::Control, "test");
        let (connector, mut ends) = ScriptedConnector::new(&[true, true]);
        let cancel = CancellationToken::new();
        tokio::spawn(run_stt(
            bus.clone(),
            session,
            SttConfig::default(),
            connector,
            cancel.clone(),
        ));

        bus.emit(session, Payload::Audio(chunk(0, 0.05))).await;
        let mut first_link = ends.recv().await.unwrap();
        first_link.audio_rx.recv().await.unwrap();

        // Service drops the connection; audio during the outage is buffered.
        first_link
            .events_tx
            .send(LinkEvent::Closed {
                detail: "reset".into(),
            })
            .await
            .unwrap();
        bus.emit(session, Payload::Audio(chunk(1, 0.05))).await;
        bus.emit(session, Payload::Audio(chunk(2, 0.05))).await;

        // Backoff elapses (paused clock auto-advances), reconnect succeeds,
        // and the buffered chunks are flushed in order.
        let mut second_link = ends.recv().await.unwrap();
        for _ in 0..2 {
            assert!(matches!(
                second_link.audio_rx.recv().await.unwrap(),
                AudioFrame::Pcm(_)
            ));
        }

        // Recovery within budget stays silent on the control topic.
        let quiet = tokio::time::timeout(Duration::from_millis(10), control.recv()).await;
        assert!(quiet.is_err(), "unexpected control event: {quiet:?}");

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn long_outage_drops_old_audio_and_reports_loss() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut diagnostics = bus.subscribe(Topic::Diagnostics, "test");
        let config = SttConfig {
            buffer_ms: 150,
            ..SttConfig::default()
        };
        let (connector, mut ends) = ScriptedConnector::new(&[true, true]);
        let cancel = CancellationToken::new();
        tokio::spawn(run_stt(bus.clone(), session, config, connector, cancel.clone()));

        bus.emit(session, Payload::Audio(chunk(0, 0.05))).await;
        let mut first_link = ends.recv().await.unwrap();
        first_link.audio_rx.recv().await.unwrap();
        first_link
            .events_tx
            .send(LinkEvent::Closed {
                detail: "reset".into(),
            })
            .await
            .unwrap();

        // 150 ms of budget only holds one 100 ms chunk: two of these three
        // must fall out of the window.
        for sequence in 1..=3 {
            bus.emit(session, Payload::Audio(chunk(sequence, 0.05))).await;
        }

        let mut second_link = ends.recv().await.unwrap();
        assert!(matches!(
            second_link.audio_rx.recv().await.unwrap(),
            AudioFrame::Pcm(_)
        ));

        let event = diagnostics.recv().await.unwrap();
        match event.payload {
            Payload::DataLoss { stage, dropped } => {
                assert_eq!(stage, Stage::Transcription);
                assert_eq!(dropped, 2);
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        cancel.cancel();
    }
}
