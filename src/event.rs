//! Typed events delivered to the client consumer.
//!
//! [`GullyEvent`]s are emitted on the bounded channel returned from
//! `GullyClient::start`. They are the client's entire read model: everything
//! a UI needs to render — phase changes, fresh snapshots, transient notices,
//! voice status — arrives here, already filtered for staleness and duplicate
//! delivery by the coordinators.

use crate::protocol::{Identity, MatchOutcome, RoomId, RoomSnapshot};

/// Events emitted by the Gully client.
#[derive(Debug, Clone)]
pub enum GullyEvent {
    /// The transport is connected and the event loop is running.
    /// Always the first event.
    Connected,

    /// The transport closed or the client shut down. Always the last event.
    Disconnected {
        /// Human-readable reason, `None` for a clean server-side close.
        reason: Option<String>,
    },

    /// The server created our room and assigned its identifier.
    RoomCreated { room_id: RoomId },

    /// Transient notice: the room we tried to join does not exist.
    RoomNotFound,

    /// Transient notice: the room we tried to join already has two players.
    RoomFull,

    /// Both participants are present and the match has started.
    /// Emitted exactly once per match, never on duplicate delivery.
    MatchStarted {
        room_id: RoomId,
        snapshot: RoomSnapshot,
    },

    /// Fresh authoritative state after a move was resolved.
    SnapshotUpdated { snapshot: RoomSnapshot },

    /// Transient notice: the batter was dismissed and innings swap.
    /// Informational only — play continues without further interaction.
    Dismissal {
        batting: Identity,
        bowling: Identity,
        final_score: u32,
        snapshot: RoomSnapshot,
    },

    /// The match ended. The rematch decision has already been taken via the
    /// injected prompt by the time this event is observed.
    MatchEnded { outcome: MatchOutcome },

    /// A rematch both sides accepted has begun; state was refreshed.
    RematchStarted { snapshot: RoomSnapshot },

    /// The rematch was declined and all local state was reset.
    MatchReset,

    /// Voice capture and the peer connection are ready for negotiation.
    VoiceReady,

    /// Voice setup failed (capture denied or the media stack errored).
    VoiceFailed { reason: String },

    /// The voice connection was torn down.
    VoiceEnded,
}
