//! Connection loop to the relay.
//!
//! One socket at a time. Commands run in their own tasks, bounded by a
//! semaphore, and push their reports into a queue that outlives the socket, so
//! a result finished during a reconnect goes out on the next connection. The
//! loop owns the socket's write half and is the only writer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::wire::{self, CommandEnvelope};
use protocol::{AgentMessage, ExecutionReport, RelayMessage};
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::handlers::Handlers;

const RESULT_QUEUE: usize = 64;
/// Upper bound of the random extra added to each reconnect delay, as a fraction.
const MAX_JITTER: f64 = 0.25;

pub(crate) struct Runtime {
    url: String,
    display_url: String,
    handlers: Arc<Handlers>,
    limiter: Arc<Semaphore>,
    reconnect_delay: Duration,
    ping_interval: Duration,
    idle_timeout: Duration,
}

impl Runtime {
    pub(crate) fn new(config: &AgentConfig, handlers: Handlers) -> Self {
        Self {
            url: with_token(&config.relay_url, &config.auth_token),
            display_url: config.relay_url.clone(),
            handlers: Arc::new(handlers),
            limiter: Arc::new(Semaphore::new(config.max_concurrency)),
            reconnect_delay: config.reconnect_delay(),
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Connects, serves, and reconnects until `shutdown` fires.
    pub(crate) async fn run(&self, shutdown: CancellationToken) {
        let (results_tx, mut results_rx) = mpsc::channel::<ExecutionReport>(RESULT_QUEUE);
        loop {
            tracing::info!(event = "relay.connecting", url = %self.display_url);
            let connect = tokio::select! {
                _ = shutdown.cancelled() => break,
                connect = tokio_tungstenite::connect_async(self.url.as_str()) => connect,
            };
            match connect {
                Ok((socket, _)) => {
                    tracing::info!(event = "relay.connected", url = %self.display_url);
                    let reason = self
                        .serve(socket, &results_tx, &mut results_rx, &shutdown)
                        .await;
                    tracing::info!(event = "relay.disconnected", reason);
                }
                Err(err) => {
                    tracing::warn!(event = "relay.connect_failed", error = %err);
                }
            }
            let delay = jittered(self.reconnect_delay);
            tracing::info!(event = "relay.reconnect_scheduled", delay_ms = delay.as_millis() as u64);
            if wait_reconnect_or_shutdown(&shutdown, delay).await {
                break;
            }
        }
        tracing::info!(event = "agent.stopped");
    }

    async fn serve<S>(
        &self,
        socket: tokio_tungstenite::WebSocketStream<S>,
        results_tx: &mpsc::Sender<ExecutionReport>,
        results_rx: &mut mpsc::Receiver<ExecutionReport>,
        shutdown: &CancellationToken,
    ) -> &'static str
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = socket.split();
        let mut ping = tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // A half-open socket never errors on read; silence is the only signal.
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);
        loop {
            let outgoing = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return "shutdown";
                }
                _ = &mut idle => {
                    tracing::warn!(
                        event = "relay.silent",
                        idle_ms = self.idle_timeout.as_millis() as u64,
                    );
                    return "liveness timeout";
                }
                _ = ping.tick() => AgentMessage::Ping,
                Some(report) = results_rx.recv() => AgentMessage::Result(report),
                frame = stream.next() => {
                    if matches!(frame, Some(Ok(_))) {
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    }
                    match frame {
                        Some(Ok(Message::Text(text))) => match self.handle_text(&text, results_tx) {
                            Some(reply) => reply,
                            None => continue,
                        },
                        Some(Ok(Message::Close(_))) => return "closed by relay",
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            tracing::warn!(event = "relay.read_failed", error = %err);
                            return "transport error";
                        }
                        None => return "closed",
                    }
                }
            };
            let text = match wire::encode(&outgoing) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(event = "relay.encode_failed", error = %err);
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Text(text)).await {
                tracing::warn!(event = "relay.write_failed", error = %err);
                if let AgentMessage::Result(report) = outgoing {
                    // Retried on the next connection.
                    if results_tx.try_send(report).is_err() {
                        tracing::error!(event = "result.lost", "result queue is full");
                    }
                }
                return "transport error";
            }
        }
    }

    /// Handles one inbound frame, returning an immediate reply if there is one.
    fn handle_text(
        &self,
        text: &str,
        results_tx: &mpsc::Sender<ExecutionReport>,
    ) -> Option<AgentMessage> {
        match wire::decode::<RelayMessage>(text) {
            Ok(RelayMessage::Execute(envelope)) => {
                self.spawn_command(envelope, results_tx.clone());
                None
            }
            Ok(RelayMessage::Ping) => Some(AgentMessage::Pong),
            Ok(RelayMessage::Pong) => None,
            Err(err) => match wire::frame_id(text) {
                Some(id) => {
                    tracing::warn!(event = "command.malformed", id = %id, error = %err);
                    Some(AgentMessage::Result(ExecutionReport::failed(
                        id,
                        format!("unsupported command: {err}"),
                    )))
                }
                None => {
                    tracing::warn!(event = "relay.bad_frame", error = %err);
                    None
                }
            },
        }
    }

    /// Runs a command in its own task once a concurrency slot is free. A panic
    /// inside the handler becomes a failed report.
    fn spawn_command(&self, envelope: CommandEnvelope, results: mpsc::Sender<ExecutionReport>) {
        let handlers = Arc::clone(&self.handlers);
        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            let id = envelope.id.clone();
            let Ok(_permit) = limiter.acquire_owned().await else {
                tracing::error!(event = "command.dropped", id = %id, "concurrency limiter closed");
                return;
            };
            let task = tokio::spawn(async move { handlers.execute(envelope).await });
            let report = match task.await {
                Ok(report) => report,
                Err(err) => {
                    tracing::error!(event = "command.crashed", id = %id, error = %err);
                    ExecutionReport::failed(id.as_str(), format!("command handler crashed: {err}"))
                }
            };
            if results.send(report).await.is_err() {
                tracing::error!(event = "result.lost", id = %id, "result queue closed");
            }
        });
    }
}

async fn wait_reconnect_or_shutdown(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
    base + base.mul_f64(factor)
}

fn with_token(base: &str, token: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}token={}", urlencoding::encode(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::handlers_for;
    use protocol::{CommandPayload, ResultStatus};
    use tokio::net::TcpListener;

    fn config_for(addr: std::net::SocketAddr) -> AgentConfig {
        AgentConfig {
            relay_url: format!("ws://{addr}/ws/agent"),
            auth_token: "t".to_string(),
            reconnect_delay_secs: 0,
            max_concurrency: 2,
            ..AgentConfig::default()
        }
    }

    async fn runtime_for(addr: std::net::SocketAddr, root: &std::path::Path) -> Runtime {
        Runtime::new(&config_for(addr), handlers_for(root, 1024).await)
    }

    async fn next_agent_message<S>(socket: &mut tokio_tungstenite::WebSocketStream<S>) -> AgentMessage
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
                .await
                .expect("frame in time")
                .expect("open")
                .expect("frame");
            if let Message::Text(text) = frame {
                return wire::decode(&text).expect("agent frame");
            }
        }
    }

    async fn send_relay(
        socket: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        message: &RelayMessage,
    ) {
        socket
            .send(Message::Text(wire::encode(message).expect("encode")))
            .await
            .expect("send");
    }

    #[tokio::test]
    async fn executes_commands_and_answers_pings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let runtime = runtime_for(listener.local_addr().expect("addr"), dir.path()).await;
        let shutdown = CancellationToken::new();
        let agent = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runtime.run(shutdown).await })
        };

        let (tcp, _) = listener.accept().await.expect("accept");
        let mut relay = tokio_tungstenite::accept_async(tcp).await.expect("handshake");

        send_relay(&mut relay, &RelayMessage::Ping).await;
        assert_eq!(next_agent_message(&mut relay).await, AgentMessage::Pong);

        send_relay(
            &mut relay,
            &RelayMessage::Execute(CommandEnvelope {
                id: "c1".to_string(),
                payload: CommandPayload::Shell {
                    command: "echo hi".to_string(),
                    working_dir: None,
                    timeout_secs: 5,
                },
            }),
        )
        .await;
        match next_agent_message(&mut relay).await {
            AgentMessage::Result(report) => {
                assert_eq!(report.id, "c1");
                assert_eq!(report.status, ResultStatus::Completed);
                assert_eq!(report.result.output.as_deref(), Some("hi\n"));
            }
            other => panic!("unexpected {other:?}"),
        }

        relay
            .send(Message::Text(
                r#"{"type":"execute","id":"c2","kind":"format_disk"}"#.to_string(),
            ))
            .await
            .expect("send");
        match next_agent_message(&mut relay).await {
            AgentMessage::Result(report) => {
                assert_eq!(report.id, "c2");
                assert_eq!(report.status, ResultStatus::Failed);
            }
            other => panic!("unexpected {other:?}"),
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), agent)
            .await
            .expect("agent stops")
            .expect("join");
    }

    #[tokio::test]
    async fn reconnects_after_the_relay_drops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let runtime = runtime_for(listener.local_addr().expect("addr"), dir.path()).await;
        let shutdown = CancellationToken::new();
        let agent = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runtime.run(shutdown).await })
        };

        let (tcp, _) = listener.accept().await.expect("accept first");
        let mut first = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
        first.close(None).await.expect("close");
        drop(first);

        let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("agent reconnects")
            .expect("accept second");
        let mut second = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
        send_relay(&mut second, &RelayMessage::Ping).await;
        assert_eq!(next_agent_message(&mut second).await, AgentMessage::Pong);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), agent).await;
    }

    #[tokio::test]
    async fn silent_relay_is_dropped_and_redialled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let config = AgentConfig {
            ping_interval_secs: 1,
            pong_timeout_secs: 1,
            ..config_for(listener.local_addr().expect("addr"))
        };
        let runtime = Runtime::new(&config, handlers_for(dir.path(), 1024).await);
        let shutdown = CancellationToken::new();
        let agent = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runtime.run(shutdown).await })
        };

        // Handshake, then never read or answer: the agent's pings go unanswered.
        let (tcp, _) = listener.accept().await.expect("accept first");
        let _silent = tokio_tungstenite::accept_async(tcp).await.expect("handshake");

        let (tcp, _) = tokio::time::timeout(Duration::from_secs(8), listener.accept())
            .await
            .expect("agent gives up on the silent relay")
            .expect("accept second");
        let mut second = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
        send_relay(&mut second, &RelayMessage::Ping).await;
        // The agent's own pings may come first at this cadence.
        loop {
            match next_agent_message(&mut second).await {
                AgentMessage::Ping => continue,
                other => {
                    assert_eq!(other, AgentMessage::Pong);
                    break;
                }
            }
        }

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), agent).await;
    }

    #[test]
    fn token_is_query_encoded() {
        assert_eq!(
            with_token("ws://relay/ws/agent", "a b&c"),
            "ws://relay/ws/agent?token=a%20b%26c"
        );
        assert_eq!(
            with_token("ws://relay/ws/agent?x=1", "tok"),
            "ws://relay/ws/agent?x=1&token=tok"
        );
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let delay = jittered(base);
            assert!(delay >= base);
            assert!(delay <= Duration::from_secs(5));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
