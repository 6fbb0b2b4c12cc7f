//! # Basic Match Example
//!
//! Demonstrates a complete Gully client lifecycle:
//!
//! 1. Connect to a session server via WebSocket
//! 2. Register an identity and create a multiplayer room
//! 3. React to match events (room created, match started, snapshots)
//! 4. Submit moves whenever the input gate opens
//! 5. Shut down gracefully on Ctrl+C or disconnect
//!
//! ## Running
//!
//! ```sh
//! # Start a Gully session server on localhost:5000, then:
//! cargo run --example basic_match
//!
//! # Override the server URL or player name:
//! GULLY_URL=ws://my-server:5000/ws GULLY_NAME=alice cargo run --example basic_match
//! ```

use gully_client::{
    AlwaysDecline, GullyClient, GullyConfig, GullyEvent, NoMedia, PlayMode, WebSocketTransport,
};

/// Default server URL when `GULLY_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:5000/ws";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Initialize tracing. Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("GULLY_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let name = std::env::var("GULLY_NAME").unwrap_or_else(|_| "RustPlayer".to_string());
    tracing::info!("Connecting to {url} as {name}");

    // ── Connect ─────────────────────────────────────────────────────
    let transport = WebSocketTransport::connect(&url).await?;

    // Start the client. This spawns a background task that drives the
    // transport and emits events on `event_rx`. This demo plays without
    // voice (`NoMedia`) and never wants a rematch (`AlwaysDecline`).
    let (mut client, mut event_rx) =
        GullyClient::start(transport, NoMedia, AlwaysDecline, GullyConfig::new());

    // Register and open a room straight away.
    client.register(name.clone())?;
    client.select_mode(PlayMode::Multiplayer)?;
    client.create_room()?;

    // Cycle through a fixed set of moves whenever the gate opens.
    let mut moves = [4u8, 6, 1, 3, 2, 5].into_iter().cycle();

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            // Branch 1: Incoming event from the client.
            event = event_rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event channel closed, exiting");
                    break;
                };

                match event {
                    GullyEvent::Connected => {
                        tracing::info!("Transport connected");
                    }

                    GullyEvent::RoomCreated { room_id } => {
                        tracing::info!("Room created — share this id with a friend: {room_id}");
                    }

                    GullyEvent::MatchStarted { room_id, .. } => {
                        tracing::info!("Match started in room {room_id}!");
                        if client.input_gate() {
                            let value = moves.next().unwrap_or(4);
                            client.submit_move(value)?;
                            tracing::info!("Played {value}");
                        }
                    }

                    GullyEvent::SnapshotUpdated { snapshot } => {
                        if let Some(room_id) = client.current_room_id().await {
                            if let Some(room) = snapshot.get(&room_id) {
                                tracing::info!("Score: {}", room.total_score);
                            }
                        }
                        if client.input_gate() {
                            let value = moves.next().unwrap_or(4);
                            client.submit_move(value)?;
                            tracing::info!("Played {value}");
                        }
                    }

                    GullyEvent::Dismissal { batting, bowling, final_score, .. } => {
                        tracing::info!(
                            "{batting} is out for {final_score} — {bowling} bats next"
                        );
                    }

                    GullyEvent::RoomNotFound => tracing::warn!("Room not found"),
                    GullyEvent::RoomFull => tracing::warn!("Room is full"),

                    GullyEvent::MatchEnded { outcome } => {
                        tracing::info!("Match over: {outcome:?}");
                    }

                    GullyEvent::MatchReset => {
                        tracing::info!("State reset — goodbye");
                        break;
                    }

                    GullyEvent::Disconnected { reason } => {
                        tracing::warn!(
                            "Disconnected: {}",
                            reason.as_deref().unwrap_or("clean close")
                        );
                        break;
                    }

                    other => {
                        tracing::debug!("Event: {other:?}");
                    }
                }
            }

            // Branch 2: Ctrl+C — shut down gracefully.
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down…");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    client.shutdown().await;
    tracing::info!("Client shut down. Goodbye!");
    Ok(())
}
