//! Audio ingest: fixed-cadence chunking, energy VAD, utterance segmentation.

pub mod chunker;
pub mod segmenter;

pub use chunker::{Chunker, rms_energy};
pub use segmenter::Segmenter;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::{AudioConfig, VadConfig};
use crate::events::{EndReason, Payload, SessionId};

/// Worker: consumes capture buffers, publishes audio chunks and VAD events.
///
/// The capture side pushes sample buffers of any size; chunks leave at the
/// configured cadence. Channel closure means the capture device is gone,
/// which is fatal for the session.
pub async fn run_ingest(
    bus: EventBus,
    session: SessionId,
    audio: AudioConfig,
    vad: VadConfig,
    mut source: mpsc::Receiver<Vec<i16>>,
    cancel: CancellationToken,
) {
    let mut chunker = Chunker::new(audio.sample_rate, audio.samples_per_chunk());
    let mut segmenter = Segmenter::new(vad);
    info!(
        "audio ingest started ({} Hz, {} ms chunks)",
        audio.sample_rate, audio.chunk_ms
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            buffer = source.recv() => {
                let Some(buffer) = buffer else {
                    warn!("capture channel closed, ending session");
                    bus.emit(session, Payload::SessionEnded { reason: EndReason::CaptureClosed })
                        .await;
                    break;
                };
                for chunk in chunker.push(&buffer) {
                    let boundary_events = segmenter.process(&chunk);
                    bus.emit(session, Payload::Audio(chunk)).await;
                    for payload in boundary_events {
                        bus.emit(session, payload).await;
                    }
                }
            }
        }
    }
    debug!("audio ingest stopped");
}
