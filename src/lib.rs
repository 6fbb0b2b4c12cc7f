//! # Gully Client
//!
//! Transport-agnostic Rust client for the Gully online hand-cricket match
//! protocol, with peer-to-peer voice signaling.
//!
//! This crate provides a high-level async client that communicates with a
//! Gully session server using JSON text messages over any bidirectional
//! transport, and coordinates the in-match voice connection with the room
//! peer over the same channel.
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement the [`Transport`] trait for any backend
//! - **WebSocket built-in** — default `transport-websocket` feature provides
//!   [`WebSocketTransport`]
//! - **Event-driven** — receive typed [`GullyEvent`]s via a channel
//! - **Turn-safe** — the input gate suppresses duplicate move submission
//!   under network latency
//! - **Voice signaling** — offer/answer negotiation with ordered candidate
//!   buffering, behind pluggable [`MediaBackend`]s
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn example() -> Result<(), gully_client::GullyError> {
//! use gully_client::{
//!     AlwaysDecline, GullyClient, GullyConfig, GullyEvent, NoMedia, PlayMode,
//!     WebSocketTransport,
//! };
//!
//! let transport = WebSocketTransport::connect("ws://localhost:5000/ws").await?;
//! let (client, mut events) =
//!     GullyClient::start(transport, NoMedia, AlwaysDecline, GullyConfig::new());
//!
//! client.register("alice")?;
//! client.select_mode(PlayMode::Multiplayer)?;
//! client.create_room()?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         GullyEvent::RoomCreated { room_id } => println!("share room id: {room_id}"),
//!         GullyEvent::MatchStarted { .. } => client.submit_move(4)?,
//!         GullyEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod peer;
pub mod protocol;
pub mod reconciler;
pub mod signaling;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{GullyClient, GullyConfig};
pub use error::GullyError;
pub use event::GullyEvent;
pub use lifecycle::{MatchPhase, PlayMode};
pub use peer::{AlwaysDecline, DecisionPrompt, MediaBackend, NoMedia, PeerConnection};
pub use protocol::{ClientMessage, MatchOutcome, ServerMessage};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
