use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::broker::SessionEvent;
use crate::manager::ManagerEvent;
use crate::session::Session;

use super::error::ApiError;
use super::AppState;

/// Capacity of the per-client frame channel feeding the SSE response.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Expose one session's live output as an ordered SSE stream.
///
/// On connect: emit a `connected` frame, then forward every `data` event in
/// arrival order and finish with an `exit` frame carrying the exit code.
/// Each connected client gets an independent, order-preserving copy of the
/// live tail — there is no replay of history predating subscription.
///
/// The forwarder exits (unsubscribing its broker receiver) as soon as the
/// client disconnects, when an explicit kill fires the detach signal, or
/// after the exit frame. A subscriber that consumes slower than the PTY
/// produces will lag the broadcast channel and skip frames rather than
/// buffer without bound.
pub(super) async fn session_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(forward_session_events(session, tx));

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

async fn forward_session_events(
    session: Session,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    // Subscribe before the connected frame so no event between the two is
    // lost.
    let mut events = session.events.subscribe();
    let mut detach_rx = session.detach_signal.subscribe();

    let connected = serde_json::json!({ "type": "connected", "sessionId": session.id });
    if send_frame(&tx, &connected).await.is_err() {
        return;
    }

    // Holds a trailing incomplete UTF-8 sequence when a PTY read splits a
    // multi-byte character across chunks.
    let mut carry: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::Data(chunk)) => {
                        let text = decode_chunk(&mut carry, &chunk);
                        if text.is_empty() {
                            continue;
                        }
                        let frame = serde_json::json!({
                            "type": "data",
                            "data": text,
                        });
                        if send_frame(&tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(SessionEvent::Exit(code)) => {
                        if !carry.is_empty() {
                            let frame = serde_json::json!({
                                "type": "data",
                                "data": String::from_utf8_lossy(&carry),
                            });
                            if send_frame(&tx, &frame).await.is_err() {
                                break;
                            }
                            carry.clear();
                        }
                        let frame = serde_json::json!({
                            "type": "exit",
                            "exitCode": code,
                        });
                        let _ = send_frame(&tx, &frame).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            session = %session.id,
                            skipped,
                            "slow stream client lagged; frames skipped"
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // Explicit kill detaches all streaming clients.
            _ = detach_rx.recv() => break,
            // Client gone; unsubscribe now rather than on the next event,
            // which on an idle session may never come.
            _ = tx.closed() => break,
        }
    }
    // Dropping `events` here removes this client's broker subscription.
}

/// Decode `carry + chunk` as UTF-8, holding back a trailing incomplete
/// sequence for the next chunk so a split multi-byte character is not
/// replaced with U+FFFD twice. Invalid bytes mid-stream are still replaced.
fn decode_chunk(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);
    let bytes = std::mem::take(carry);
    match std::str::from_utf8(&bytes) {
        Ok(text) => text.to_string(),
        Err(e) if e.error_len().is_none() => {
            // Valid prefix plus an incomplete trailing sequence.
            let valid = e.valid_up_to();
            carry.extend_from_slice(&bytes[valid..]);
            String::from_utf8_lossy(&bytes[..valid]).into_owned()
        }
        Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

/// Expose the manager's command outcome events as SSE.
///
/// This is the observable side of fire-and-forget submission: `result`
/// frames carry parsed JSON documents, `text` frames carry raw output that
/// failed to parse.
pub(super) async fn manager_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut events = state.manager.subscribe();
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tx.closed() => break,
            };
            match event {
                Ok(ManagerEvent::Result { command, value }) => {
                    let frame = serde_json::json!({
                        "type": "result",
                        "command": command,
                        "result": value,
                    });
                    if send_frame(&tx, &frame).await.is_err() {
                        break;
                    }
                }
                Ok(ManagerEvent::Text { command, output }) => {
                    let frame = serde_json::json!({
                        "type": "text",
                        "command": command,
                        "output": output,
                    });
                    if send_frame(&tx, &frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

async fn send_frame(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    payload: &serde_json::Value,
) -> Result<(), ()> {
    let event = Event::default().data(payload.to_string());
    tx.send(Ok(event)).await.map_err(|_| ())
}
