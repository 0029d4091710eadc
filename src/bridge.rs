//! Operator bridge: a WebSocket window into the session.
//!
//! The bridge is a thin transport adapter, not part of the orchestration core.
//! Connected clients push base64 PCM into the capture channel and receive
//! final transcripts, response text fragments, synthesized audio, and
//! user-visible faults as JSON messages. One message shape covers both
//! directions; only `audio` flows inbound.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription, Topic};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::events::{Payload, SessionId};

/// One JSON message on the bridge socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Inbound capture audio: base64 16-bit little-endian PCM.
    Audio {
        pcm: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp_ms: Option<u64>,
    },
    /// Outbound final transcript for one utterance.
    Transcription { text: String, utterance: u64 },
    /// Outbound response increment: text fragment or base64 audio. The
    /// increment closing the turn carries `is_final` and no content.
    Response {
        turn: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        #[serde(default)]
        is_final: bool,
    },
    /// Outbound user-visible fault.
    Error { detail: String },
}

#[derive(Clone)]
struct BridgeState {
    bus: EventBus,
    session: SessionId,
    capture_tx: mpsc::Sender<Vec<i16>>,
    cancel: CancellationToken,
}

/// Per-connection bus subscriptions, taken before the socket loop starts so
/// no event published after the handshake is missed.
struct BridgeSubs {
    transcripts: Subscription,
    responses: Subscription,
    synthesis: Subscription,
    control: Subscription,
}

/// Bind the configured address and serve the bridge until cancelled.
///
/// # Errors
/// Returns `OrchestratorError::Io` when the address cannot be bound or the
/// server fails.
pub async fn run_bridge(
    bus: EventBus,
    session: SessionId,
    config: BridgeConfig,
    capture_tx: mpsc::Sender<Vec<i16>>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&config.bind).await?;
    let local_addr = listener.local_addr()?;
    info!("operator bridge listening on ws://{local_addr}/ws");
    serve(
        listener,
        BridgeState {
            bus,
            session,
            capture_tx,
            cancel,
        },
    )
    .await
}

async fn serve(listener: TcpListener, state: BridgeState) -> Result<()> {
    let cancel = state.cancel.clone();
    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: BridgeState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let subs = BridgeSubs {
        transcripts: state.bus.subscribe(Topic::Transcripts, "bridge"),
        responses: state.bus.subscribe(Topic::Responses, "bridge"),
        synthesis: state.bus.subscribe(Topic::Synthesis, "bridge"),
        control: state.bus.subscribe(Topic::Control, "bridge"),
    };
    let forwarder = tokio::spawn(forward_events(
        state.cancel.clone(),
        subs,
        out_tx.clone(),
    ));
    debug!("bridge client connected");

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                warn!("bridge receive error: {e}");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if let Err(detail) = handle_client_text(&state, text.as_str()).await {
                    send_wire(&out_tx, &WireMessage::Error { detail });
                }
            }
            Message::Binary(_) => {
                send_wire(
                    &out_tx,
                    &WireMessage::Error {
                        detail: "binary frames are not part of the bridge protocol".to_owned(),
                    },
                );
            }
            Message::Close(_) => break,
            Message::Ping(payload) => {
                let _ = out_tx.send(Message::Pong(payload));
            }
            Message::Pong(_) => {}
        }
    }

    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    debug!("bridge client disconnected");
}

/// Pump bus events out to the client until the session or socket ends.
async fn forward_events(
    cancel: CancellationToken,
    mut subs: BridgeSubs,
    out_tx: mpsc::UnboundedSender<Message>,
) {
    loop {
        let maybe = tokio::select! {
            () = cancel.cancelled() => break,
            maybe = subs.transcripts.recv() => maybe,
            maybe = subs.responses.recv() => maybe,
            maybe = subs.synthesis.recv() => maybe,
            maybe = subs.control.recv() => maybe,
        };
        let Some(event) = maybe else { break };
        if matches!(event.payload, Payload::SessionEnded { .. }) {
            let _ = out_tx.send(Message::Close(None));
            break;
        }
        if let Some(wire) = wire_for_event(&event.payload)
            && !send_wire(&out_tx, &wire)
        {
            break;
        }
    }
}

/// Map a bus payload to its outbound wire shape, if it has one.
fn wire_for_event(payload: &Payload) -> Option<WireMessage> {
    match payload {
        Payload::Transcript(t) if t.is_final => Some(WireMessage::Transcription {
            text: t.text.clone(),
            utterance: t.utterance.value(),
        }),
        Payload::Response(r) if !r.text.is_empty() => Some(WireMessage::Response {
            turn: r.turn.value(),
            text: Some(r.text.clone()),
            audio: None,
            is_final: false,
        }),
        Payload::Synthesis(s) => {
            if s.is_final {
                // The synthesis terminal is the turn's single closing message.
                Some(WireMessage::Response {
                    turn: s.turn.value(),
                    text: None,
                    audio: None,
                    is_final: true,
                })
            } else if s.audio.is_empty() {
                None
            } else {
                Some(WireMessage::Response {
                    turn: s.turn.value(),
                    text: None,
                    audio: Some(BASE64.encode(&s.audio)),
                    is_final: false,
                })
            }
        }
        Payload::Fallback { turn, text } => Some(WireMessage::Response {
            turn: turn.value(),
            text: Some(text.clone()),
            audio: None,
            is_final: false,
        }),
        Payload::StreamUnavailable { stage, detail } => Some(WireMessage::Error {
            detail: format!("{stage} unavailable: {detail}"),
        }),
        _ => None,
    }
}

async fn handle_client_text(state: &BridgeState, text: &str) -> std::result::Result<(), String> {
    let message: WireMessage =
        serde_json::from_str(text).map_err(|e| format!("unparseable message: {e}"))?;
    match message {
        WireMessage::Audio { pcm, .. } => {
            let samples = decode_pcm(&pcm)?;
            state
                .capture_tx
                .send(samples)
                .await
                .map_err(|_| "capture channel closed".to_owned())
        }
        _ => Err("only audio messages flow inbound".to_owned()),
    }
}

fn decode_pcm(pcm: &str) -> std::result::Result<Vec<i16>, String> {
    let bytes = BASE64
        .decode(pcm)
        .map_err(|e| format!("invalid base64 audio: {e}"))?;
    if bytes.len() % 2 != 0 {
        return Err("PCM payload length must be even".to_owned());
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

fn send_wire(out_tx: &mpsc::UnboundedSender<Message>, wire: &WireMessage) -> bool {
    match serde_json::to_string(wire) {
        Ok(json) => out_tx.send(Message::Text(json.into())).is_ok(),
        Err(e) => {
            warn!("bridge serialization failed: {e}");
            true
        }
    }
}
