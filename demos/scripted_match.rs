//! # Scripted Match Example
//!
//! Shows how to implement the [`Transport`] trait with a simple in-process
//! loopback channel, then plays a complete short match against a scripted
//! fake server. This is useful for:
//!
//! - **Testing** — exercise your UI glue without a real server
//! - **Custom backends** — adapt any I/O layer (TCP, QUIC, WebRTC data channels)
//!
//! ## Running
//!
//! ```sh
//! cargo run --example scripted_match
//! ```

use async_trait::async_trait;
use gully_client::protocol::{
    ClientMessage, Participant, RoomSnapshot, RoomState, ServerMessage,
};
use gully_client::{
    AlwaysDecline, GullyClient, GullyConfig, GullyError, GullyEvent, NoMedia, PlayMode, Transport,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: Define a channel-based "loopback" transport
// ─────────────────────────────────────────────────────────────────────

/// A loopback transport that shuttles messages through in-process channels.
pub struct LoopbackTransport {
    /// Messages the client sends go here (server reads from the other end).
    tx: mpsc::UnboundedSender<String>,
    /// Messages the server sends arrive here (client reads them).
    rx: mpsc::UnboundedReceiver<String>,
}

/// The "server side" of the loopback — use this to drive the conversation.
pub struct LoopbackServer {
    /// Read what the client sent.
    pub rx: mpsc::UnboundedReceiver<String>,
    /// Send messages to the client (as if they came from a server).
    pub tx: mpsc::UnboundedSender<String>,
}

/// Create a connected `(transport, server)` pair.
fn loopback_pair() -> (LoopbackTransport, LoopbackServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    (
        LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        },
        LoopbackServer {
            rx: server_rx,
            tx: server_tx,
        },
    )
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Implement the Transport trait
// ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl Transport for LoopbackTransport {
    /// Send a JSON message to the "server" side of the loopback.
    async fn send(&mut self, message: String) -> Result<(), GullyError> {
        self.tx
            .send(message)
            .map_err(|e| GullyError::TransportSend(e.to_string()))
    }

    /// Receive the next message from the "server" side.
    ///
    /// Returns `None` when the server channel is closed — this is how the
    /// client discovers that the connection has ended.
    ///
    /// This method is **cancel-safe** because `mpsc::UnboundedReceiver::recv`
    /// is cancel-safe.
    async fn recv(&mut self) -> Option<Result<String, GullyError>> {
        self.rx.recv().await.map(Ok)
    }

    /// Close is a no-op for channels — dropping is sufficient.
    async fn close(&mut self) -> Result<(), GullyError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: A tiny scripted session server
// ─────────────────────────────────────────────────────────────────────

/// Build the room table the fake server pushes after each ball.
fn snapshot(room_id: &str, total: u32) -> RoomSnapshot {
    let mut table = RoomSnapshot::new();
    table.insert(
        room_id.to_string(),
        RoomState {
            participants: vec![
                Participant {
                    identity: "RustPlayer".into(),
                    score: total,
                    out: false,
                },
                Participant {
                    identity: "ghost".into(),
                    score: 0,
                    out: false,
                },
            ],
            batting: Some("RustPlayer".into()),
            bowling: Some("ghost".into()),
            turn_owner: None,
            total_score: total,
        },
    );
    table
}

fn push(server: &LoopbackServer, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = server.tx.send(json);
    }
}

/// Run the fake server: accept one room, score three balls, end the match.
async fn run_fake_server(mut server: LoopbackServer) {
    let room_id = "DEMO42";
    let mut total = 0u32;
    let mut balls = 0u32;

    while let Some(raw) = server.rx.recv().await {
        let Ok(msg) = serde_json::from_str::<ClientMessage>(&raw) else {
            tracing::warn!("fake server: unparseable client message: {raw}");
            continue;
        };
        match msg {
            ClientMessage::CreateRoom { identity } => {
                tracing::info!("fake server: {identity} created {room_id}");
                push(
                    &server,
                    &ServerMessage::RoomCreated {
                        room_id: room_id.into(),
                    },
                );
                // A second player "joins" immediately.
                push(
                    &server,
                    &ServerMessage::PlayableNow {
                        room_id: room_id.into(),
                        snapshot: snapshot(room_id, 0),
                    },
                );
            }
            ClientMessage::SubmitMove { value, .. } => {
                balls += 1;
                total += u32::from(value);
                tracing::info!("fake server: ball {balls}, total {total}");
                if balls < 3 {
                    push(
                        &server,
                        &ServerMessage::SnapshotUpdated {
                            snapshot: snapshot(room_id, total),
                        },
                    );
                } else {
                    push(
                        &server,
                        &ServerMessage::MatchEnded {
                            winner: Some("RustPlayer".into()),
                            draw: false,
                            snapshot: snapshot(room_id, total),
                            room_id: room_id.into(),
                        },
                    );
                }
            }
            other => {
                tracing::debug!("fake server: ignoring {other:?}");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: Wire together the client and the fake server
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (transport, server) = loopback_pair();
    tokio::spawn(run_fake_server(server));

    let (mut client, mut event_rx) =
        GullyClient::start(transport, NoMedia, AlwaysDecline, GullyConfig::new());

    client.register("RustPlayer")?;
    client.select_mode(PlayMode::Multiplayer)?;
    client.create_room()?;

    let mut moves = [4u8, 6, 2].into_iter();

    while let Some(event) = event_rx.recv().await {
        match event {
            GullyEvent::Connected => tracing::info!("connected"),
            GullyEvent::RoomCreated { room_id } => tracing::info!("room created: {room_id}"),
            GullyEvent::MatchStarted { .. } | GullyEvent::SnapshotUpdated { .. } => {
                if client.input_gate() {
                    if let Some(value) = moves.next() {
                        client.submit_move(value)?;
                        tracing::info!("played {value}");
                    }
                }
            }
            GullyEvent::MatchEnded { outcome } => {
                tracing::info!("match over: {outcome:?}");
            }
            GullyEvent::MatchReset => {
                // AlwaysDecline turned the rematch down; we are done.
                break;
            }
            GullyEvent::Disconnected { reason } => {
                tracing::info!("disconnected: {}", reason.as_deref().unwrap_or("clean"));
                break;
            }
            other => tracing::debug!("event: {other:?}"),
        }
    }

    client.shutdown().await;
    tracing::info!("Done — scripted match complete!");
    Ok(())
}
