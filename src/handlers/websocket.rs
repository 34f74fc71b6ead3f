use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures_util::{stream::select_all, stream::BoxStream, Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::frame::{BinaryFrame, FrameType};
use crate::protocol::messages::{ClientMessage, ServerEvent};
use crate::session::orchestrator::{TurnInput, TurnRunner};
use crate::session::{Outbound, Session, TurnEvent};
use crate::state::AppState;

/// Bounded wait for an aborted turn to unwind before the next one starts.
/// The writer drops stale frames either way.
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Upgrades the HTTP connection to the conversation WebSocket.
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!("WebSocket handshake attempt from {}", addr);
    ws.on_upgrade(move |socket| handle_socket_inner(socket, addr, state))
}

enum LoopEvent {
    Ws(Result<Message, axum::Error>),
    Turn(TurnEvent),
}

/// Sole owner of the socket sink. Turn-tagged frames are compared against
/// the session's active-turn counter and silently dropped when stale, so an
/// aborted pipeline can never leak audio for a dead turn.
async fn writer_task<S>(mut rx: mpsc::Receiver<Outbound>, mut sink: S, active_turn: Arc<AtomicU64>)
where
    S: Sink<Message> + Unpin,
{
    while let Some(out) = rx.recv().await {
        if let Some(turn) = out.turn {
            if turn != active_turn.load(Ordering::Acquire) {
                debug!(turn, "Dropping frame for stale turn");
                continue;
            }
        }
        if sink.send(out.message).await.is_err() {
            break;
        }
    }
}

async fn handle_socket_inner(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    info!(
        "WebSocket connection established with {} (session {})",
        addr, session_id
    );

    let mut session = Session::new(session_id, state.config.conversation.clone());

    let (sender, receiver) = socket.split();
    // 256 buffer
    let (tx, rx) = mpsc::channel::<Outbound>(256);
    let writer_handle = tokio::spawn(writer_task(rx, sender, session.active_turn_handle()));

    let (event_tx, event_rx) = mpsc::channel::<TurnEvent>(16);

    let ws_stream = receiver.map(LoopEvent::Ws);
    let turn_stream = ReceiverStream::new(event_rx).map(LoopEvent::Turn);
    let streams: Vec<BoxStream<'static, LoopEvent>> =
        vec![Box::pin(ws_stream), Box::pin(turn_stream)];
    let mut all_events = select_all(streams);

    let mut orchestrator: Option<JoinHandle<()>> = None;

    while let Some(event) = all_events.next().await {
        match event {
            LoopEvent::Ws(Ok(msg)) => match msg {
                Message::Text(text) => {
                    handle_text(
                        &state,
                        &mut session,
                        &tx,
                        &event_tx,
                        &mut orchestrator,
                        text.as_str(),
                    )
                    .await;
                }
                Message::Binary(bin) => {
                    handle_binary(
                        &state,
                        &mut session,
                        &tx,
                        &event_tx,
                        &mut orchestrator,
                        &bin,
                    )
                    .await;
                }
                Message::Ping(_) => {
                    let _ = tx.try_send(Outbound::untagged(Message::Pong(vec![].into())));
                }
                Message::Pong(_) => {}
                Message::Close(_) => {
                    info!("Client closed the connection");
                    break;
                }
            },
            LoopEvent::Ws(Err(e)) => {
                error!("WS error: {}", e);
                break;
            }
            LoopEvent::Turn(event) => {
                session.apply_event(event);
            }
        }
    }

    // Socket is gone: cancel everything the session owns.
    session.close();
    writer_handle.abort();
    if let Some(handle) = orchestrator.take() {
        let _ = timeout(ABORT_GRACE, handle).await;
    }
    info!("WebSocket connection with {} closed.", addr);
}

async fn handle_text(
    state: &AppState,
    session: &mut Session,
    tx: &Sender<Outbound>,
    event_tx: &Sender<TurnEvent>,
    orchestrator: &mut Option<JoinHandle<()>>,
    text: &str,
) {
    debug!("Received text message: {}", text);
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Bad JSON from client: {}", e);
            send_protocol_error(tx, "消息格式错误").await;
            return;
        }
    };
    let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
        warn!("Message missing 'type' field");
        send_protocol_error(tx, "消息缺少 type 字段").await;
        return;
    };

    match kind {
        "text" | "control" => match serde_json::from_value::<ClientMessage>(value) {
            Ok(ClientMessage::Text { text, .. }) => {
                if text.trim().is_empty() {
                    debug!("Ignoring empty text message");
                    return;
                }
                start_turn(
                    state,
                    session,
                    tx,
                    event_tx,
                    orchestrator,
                    TurnInput::Text(text),
                )
                .await;
            }
            Ok(ClientMessage::Control { action }) => match action.as_str() {
                "abort" => {
                    info!("Client aborted the current turn");
                    session.abort();
                }
                // Reserved for future session control.
                "start" | "stop" | "config" => {
                    debug!("Control action '{}' is reserved", action);
                }
                other => {
                    warn!("Unknown control action '{}', ignoring", other);
                }
            },
            Err(e) => {
                warn!("Malformed '{}' message: {}", kind, e);
                send_protocol_error(tx, "消息字段不完整").await;
            }
        },
        other => {
            // Unknown types never close the session.
            warn!("Unknown message type '{}', ignoring", other);
        }
    }
}

async fn handle_binary(
    state: &AppState,
    session: &mut Session,
    tx: &Sender<Outbound>,
    event_tx: &Sender<TurnEvent>,
    orchestrator: &mut Option<JoinHandle<()>>,
    bin: &[u8],
) {
    let frame = match BinaryFrame::parse(bin) {
        Ok(f) => f,
        Err(e) => {
            warn!("Malformed binary frame: {}", e);
            send_protocol_error(tx, "音频帧格式错误").await;
            return;
        }
    };

    match frame.frame_type {
        FrameType::AudioIn => {
            if !session.capturing() {
                session.begin_audio(frame.format);
            }
            session.append_audio(&frame.payload);
            if frame.is_final {
                // An empty capture still goes through the pipeline; the ASR
                // adapter rejects it and the client gets an error frame.
                let (bytes, format) = session.finish_audio();
                start_turn(
                    state,
                    session,
                    tx,
                    event_tx,
                    orchestrator,
                    TurnInput::Audio { bytes, format },
                )
                .await;
            }
        }
        FrameType::TtsOut => {
            warn!("Client sent a TTS-out frame, ignoring");
        }
    }
}

/// Aborts any running turn, waits (bounded) for it to unwind, then spawns
/// the orchestrator for the new one.
async fn start_turn(
    state: &AppState,
    session: &mut Session,
    tx: &Sender<Outbound>,
    event_tx: &Sender<TurnEvent>,
    orchestrator: &mut Option<JoinHandle<()>>,
    input: TurnInput,
) {
    if let Some(handle) = orchestrator.take() {
        if !handle.is_finished() {
            session.abort();
            if timeout(ABORT_GRACE, handle).await.is_err() {
                warn!("Aborted turn did not unwind within {:?}", ABORT_GRACE);
            }
        }
    }

    let turn = session.begin_turn();
    let runner = TurnRunner {
        session_id: session.id.clone(),
        handle: turn,
        config: session.config.clone(),
        providers: Arc::clone(&state.providers),
        characters: Arc::clone(&state.characters),
        out: tx.clone(),
        events: event_tx.clone(),
        provider_deadline: Duration::from_millis(state.config.pipeline.provider_timeout_ms),
    };
    *orchestrator = Some(tokio::spawn(runner.run(input)));
}

/// Protocol errors keep the session open; the client just gets told.
async fn send_protocol_error(tx: &Sender<Outbound>, message: &str) {
    let event = ServerEvent::error(message);
    let _ = tx
        .send(Outbound::untagged(Message::Text(event.to_json().into())))
        .await;
}
