//! Wire-compatible protocol types for the Gully match protocol.
//!
//! Every type in this module produces identical JSON to the session server's
//! message layer. Messages are adjacently tagged
//! (`{"type": "Variant", "data": {…}}`); snapshot payloads are relayed as the
//! server pushes them, wholesale.
//!
//! Signaling payloads ([`SessionDescription`], [`IceCandidate`]) are opaque
//! to the server — it forwards them verbatim between the two room peers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Type aliases ────────────────────────────────────────────────────

/// Opaque identity chosen by the local player before any room operation.
///
/// Immutable once a room exists; cleared only by the rematch-declined reset.
pub type Identity = String;

/// Server-assigned room identifier. Never changes for the lifetime of a match.
pub type RoomId = String;

/// Authoritative point-in-time copy of all room state, keyed by room
/// identifier. The server pushes the full mapping on every update; the
/// client replaces its copy wholesale (last writer wins, no merge).
pub type RoomSnapshot = HashMap<RoomId, RoomState>;

// ── Snapshot model ──────────────────────────────────────────────────

/// One participant in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// The participant's identity.
    pub identity: Identity,
    /// Accumulated score for the current innings.
    pub score: u32,
    /// Whether this participant has been dismissed.
    pub out: bool,
}

/// Authoritative state of a single room.
///
/// At most two participants. The batting/bowling assignment and the turn
/// owner are determined entirely by the server; the client never computes
/// them locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoomState {
    /// Ordered pair of participants (first to join first).
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Identity currently batting, once the server has assigned innings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batting: Option<Identity>,
    /// Identity currently bowling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bowling: Option<Identity>,
    /// Identity currently permitted to submit a move. Absent when the server
    /// re-opens input for both participants (the common case between balls).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_owner: Option<Identity>,
    /// Monotonically-updated total for the innings in progress.
    #[serde(default)]
    pub total_score: u32,
}

impl RoomState {
    /// Look up a participant by identity.
    pub fn participant(&self, identity: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.identity == identity)
    }
}

/// Final result of a match, as projected into consumer events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The named participant won.
    Winner(Identity),
    /// Both innings ended level.
    Draw,
}

// ── Signaling payloads ──────────────────────────────────────────────

/// A session description produced by one peer's media stack and relayed
/// verbatim to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `"offer"` or `"answer"`.
    pub kind: String,
    /// The raw SDP body.
    pub sdp: String,
}

impl SessionDescription {
    /// Construct an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    /// Construct an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// A network candidate gathered by one peer's media stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The raw candidate line.
    pub candidate: String,
    /// Media-stream identification tag, when the stack provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media-line index, when the stack provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Create a new room owned by this identity.
    CreateRoom { identity: Identity },
    /// Join an existing room by identifier.
    JoinRoom { identity: Identity, room_id: RoomId },
    /// Submit a move for the current ball.
    SubmitMove { room_id: RoomId, value: u8 },
    /// Start a singleplayer match against the server's automated opponent.
    PlayVsAutomated { identity: Identity },
    /// Request a rematch in the same room after a match has ended.
    Rematch { room_id: RoomId },
    /// Relay a session-description offer to the room peer.
    SignalOffer { description: SessionDescription },
    /// Relay a session-description answer to the room peer.
    SignalAnswer { description: SessionDescription },
    /// Relay a network candidate to the room peer.
    SignalCandidate { candidate: IceCandidate },
}

/// Message types sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// The requested room was created; carries its server-assigned identifier.
    RoomCreated { room_id: RoomId },
    /// A join request named a room the server does not know.
    RoomNotFound,
    /// A join request named a room that already has two participants.
    RoomFull,
    /// Both participants are present; the match can start.
    PlayableNow {
        room_id: RoomId,
        snapshot: RoomSnapshot,
    },
    /// A move was resolved; fresh authoritative state for all rooms.
    SnapshotUpdated { snapshot: RoomSnapshot },
    /// The batter was dismissed; innings swap follows in the snapshot.
    Dismissal {
        batting: Identity,
        bowling: Identity,
        snapshot: RoomSnapshot,
        final_score: u32,
    },
    /// The second innings ended with a winner, no final snapshot attached.
    MatchWon { winner: Identity, room_id: RoomId },
    /// The match ended; either a winner or a draw, with the final snapshot.
    MatchEnded {
        winner: Option<Identity>,
        draw: bool,
        snapshot: RoomSnapshot,
        room_id: RoomId,
    },
    /// A rematch both sides agreed to has been set up; fresh state follows.
    RematchState { snapshot: RoomSnapshot },
    /// The room peer sent a session-description offer.
    SignalOffer { description: SessionDescription },
    /// The room peer sent a session-description answer.
    SignalAnswer { description: SessionDescription },
    /// The room peer gathered a network candidate.
    SignalCandidate { candidate: IceCandidate },
}
