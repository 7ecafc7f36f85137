use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::{wire, AgentMessage, RelayMessage};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::OUTBOUND_CAPACITY;
use crate::config::LivenessConfig;
use crate::dispatcher::Dispatcher;

/// Runs one authenticated executor connection until it closes, goes quiet for
/// longer than the grace window, or is superseded.
pub(crate) async fn serve_executor(
    socket: WebSocket,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    liveness: LivenessConfig,
) {
    let (sink, stream) = socket.split();
    run_session(sink, stream, peer, dispatcher, liveness).await;
}

async fn run_session<Si, St>(
    mut sink: Si,
    mut stream: St,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    liveness: LivenessConfig,
) where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: std::fmt::Display,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<RelayMessage>(OUTBOUND_CAPACITY);
    let sessions = Arc::clone(dispatcher.sessions());
    let ticket = sessions.attach(&peer.to_string(), tx.clone());
    let session_id = ticket.id;
    let closed = ticket.closed.clone();

    let writer = {
        let closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = closed.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let text = match wire::encode(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(event = "session.encode_failed", session_id, error = %err);
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    tracing::warn!(event = "session.write_failed", session_id, error = %err);
                    break;
                }
            }
            closed.cancel();
            let _ = sink.send(Message::Close(None)).await;
        })
    };

    {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(err) = dispatcher.recover(session_id).await {
                tracing::error!(event = "recovery.failed", session_id, error = %err);
            }
        });
    }

    let grace = liveness.grace();
    let mut ping = tokio::time::interval_at(
        Instant::now() + liveness.ping_interval(),
        liveness.ping_interval(),
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(grace);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            _ = closed.cancelled() => break "closed",
            _ = &mut idle => break "liveness timeout",
            _ = ping.tick() => {
                if tx.try_send(RelayMessage::Ping).is_err() {
                    tracing::debug!(event = "session.ping_skipped", session_id);
                }
            }
            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        tracing::warn!(event = "session.read_failed", session_id, error = %err);
                        break "transport error";
                    }
                    None => break "disconnected",
                };
                idle.as_mut().reset(Instant::now() + grace);
                match frame {
                    Message::Text(text) => handle_text(&dispatcher, &tx, session_id, &text).await,
                    Message::Close(_) => break "closed by executor",
                    _ => {}
                }
            }
        }
    };

    sessions.detach(session_id);
    closed.cancel();
    let _ = writer.await;
    tracing::info!(event = "session.closed", session_id, peer = %peer, reason);
}

async fn handle_text(
    dispatcher: &Dispatcher,
    tx: &mpsc::Sender<RelayMessage>,
    session_id: u64,
    text: &str,
) {
    match wire::decode::<AgentMessage>(text) {
        Ok(AgentMessage::Result(report)) => dispatcher.handle_report(report).await,
        Ok(AgentMessage::Ping) => {
            let _ = tx.try_send(RelayMessage::Pong);
        }
        Ok(AgentMessage::Pong) => {}
        Err(err) => {
            tracing::warn!(
                event = "session.bad_frame",
                session_id,
                id = ?wire::frame_id(text),
                error = %err,
            );
        }
    }
}
