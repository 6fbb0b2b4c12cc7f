//! Session reconciliation: authoritative snapshot ownership and input gating.
//!
//! [`SessionReconciler`] is the only owner of the local [`RoomSnapshot`]
//! copy and the input gate. Every inbound snapshot replaces the copy
//! wholesale — last writer wins, no merging — and the gate is recomputed
//! from the new snapshot alone, never from history.
//!
//! The gate is the single concurrency-correctness mechanism against
//! duplicate move submission under network latency: it closes the moment a
//! move is handed to the transport and does not reopen until the server's
//! next snapshot arrives.

use tracing::debug;

use crate::error::{GullyError, Result};
use crate::protocol::{ClientMessage, Identity, RoomId, RoomSnapshot, RoomState};

/// Owner of the authoritative room snapshot and the local input gate.
#[derive(Debug, Default)]
pub struct SessionReconciler {
    identity: Option<Identity>,
    room_id: Option<RoomId>,
    snapshot: RoomSnapshot,
    input_gate: bool,
}

impl SessionReconciler {
    /// Create an empty reconciler with the gate closed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the local identity used for turn-ownership checks.
    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    /// Bind the room whose state gates local input.
    pub fn set_room(&mut self, room_id: RoomId) {
        self.room_id = Some(room_id);
    }

    /// Whether the player may currently submit a move.
    pub fn input_gate(&self) -> bool {
        self.input_gate
    }

    /// The current snapshot (possibly empty).
    pub fn snapshot(&self) -> &RoomSnapshot {
        &self.snapshot
    }

    /// State of the room this session is bound to, if present in the snapshot.
    pub fn room_state(&self) -> Option<&RoomState> {
        self.room_id.as_ref().and_then(|id| self.snapshot.get(id))
    }

    /// Replace the snapshot wholesale and recompute the gate from it.
    ///
    /// The gate derives solely from the new snapshot's turn-owner field: it
    /// opens when the owner matches the local identity or when the server
    /// left the field unset (input re-enabled for both participants), and
    /// closes when another identity owns the turn or the bound room is
    /// absent from the snapshot.
    pub fn apply_snapshot(&mut self, snapshot: RoomSnapshot) {
        self.snapshot = snapshot;
        self.input_gate = self.derive_gate();
        debug!(gate = self.input_gate, "reconciler: snapshot applied");
    }

    /// Close the gate and yield the outbound move message.
    ///
    /// The snapshot is never mutated locally — the only source of truth for
    /// the move's effect is the next inbound snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::InputGated`] while a previous move awaits
    /// acknowledgement, or [`GullyError::NotInRoom`] before a room is bound.
    pub fn record_move(&mut self, value: u8) -> Result<ClientMessage> {
        if !self.input_gate {
            return Err(GullyError::InputGated);
        }
        let room_id = self.room_id.clone().ok_or(GullyError::NotInRoom)?;
        self.input_gate = false;
        debug!(value, "reconciler: move recorded, gate closed");
        Ok(ClientMessage::SubmitMove { room_id, value })
    }

    /// Apply a dismissal delivery: replace the snapshot and recompute the
    /// gate so play continues. The caller surfaces the summary notice.
    pub fn apply_dismissal(&mut self, snapshot: RoomSnapshot) {
        self.snapshot = snapshot;
        self.input_gate = self.derive_gate();
        debug!(gate = self.input_gate, "reconciler: dismissal applied");
    }

    /// Drop the snapshot, unbind the room and identity, and close the gate.
    /// Used by the rematch-declined reset; idempotent.
    pub fn clear(&mut self) {
        self.identity = None;
        self.room_id = None;
        self.snapshot.clear();
        self.input_gate = false;
        debug!("reconciler: cleared");
    }

    fn derive_gate(&self) -> bool {
        let Some(room) = self.room_state() else {
            return false;
        };
        match (&room.turn_owner, &self.identity) {
            (Some(owner), Some(me)) => owner == me,
            // No turn owner recorded: the server re-enabled both players.
            _ => true,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::Participant;

    fn snapshot_with(room_id: &str, turn_owner: Option<&str>) -> RoomSnapshot {
        let mut snapshot = RoomSnapshot::new();
        snapshot.insert(
            room_id.to_string(),
            RoomState {
                participants: vec![
                    Participant {
                        identity: "alice".into(),
                        score: 12,
                        out: false,
                    },
                    Participant {
                        identity: "bob".into(),
                        score: 0,
                        out: false,
                    },
                ],
                batting: Some("alice".into()),
                bowling: Some("bob".into()),
                turn_owner: turn_owner.map(String::from),
                total_score: 12,
            },
        );
        snapshot
    }

    fn bound(identity: &str, room_id: &str) -> SessionReconciler {
        let mut rec = SessionReconciler::new();
        rec.set_identity(identity.into());
        rec.set_room(room_id.into());
        rec
    }

    #[test]
    fn gate_closed_before_any_snapshot() {
        let rec = bound("alice", "R1");
        assert!(!rec.input_gate());
    }

    #[test]
    fn gate_follows_turn_owner() {
        let mut rec = bound("alice", "R1");

        rec.apply_snapshot(snapshot_with("R1", Some("alice")));
        assert!(rec.input_gate());

        rec.apply_snapshot(snapshot_with("R1", Some("bob")));
        assert!(!rec.input_gate());
    }

    #[test]
    fn absent_turn_owner_opens_gate() {
        let mut rec = bound("alice", "R1");
        rec.apply_snapshot(snapshot_with("R1", None));
        assert!(rec.input_gate());
    }

    #[test]
    fn gate_derives_from_latest_snapshot_only() {
        let mut rec = bound("alice", "R1");
        // A sequence of deliveries: the gate after each equals the
        // turn-owner check on that snapshot alone.
        for (owner, expect) in [
            (Some("alice"), true),
            (Some("bob"), false),
            (None, true),
            (Some("bob"), false),
            (Some("alice"), true),
        ] {
            rec.apply_snapshot(snapshot_with("R1", owner));
            assert_eq!(rec.input_gate(), expect, "owner {owner:?}");
        }
    }

    #[test]
    fn missing_room_closes_gate() {
        let mut rec = bound("alice", "R1");
        rec.apply_snapshot(snapshot_with("R2", None));
        assert!(!rec.input_gate());
    }

    #[test]
    fn record_move_closes_gate_and_yields_message() {
        let mut rec = bound("alice", "R1");
        rec.apply_snapshot(snapshot_with("R1", None));

        let msg = rec.record_move(4).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::SubmitMove { room_id, value } if room_id == "R1" && value == 4
        ));
        assert!(!rec.input_gate());
    }

    #[test]
    fn second_move_before_snapshot_is_suppressed() {
        let mut rec = bound("alice", "R1");
        rec.apply_snapshot(snapshot_with("R1", None));

        rec.record_move(4).unwrap();
        let err = rec.record_move(6).unwrap_err();
        assert!(matches!(err, GullyError::InputGated));
    }

    #[test]
    fn snapshot_reopens_gate_after_move() {
        let mut rec = bound("alice", "R1");
        rec.apply_snapshot(snapshot_with("R1", None));
        rec.record_move(2).unwrap();
        assert!(!rec.input_gate());

        rec.apply_snapshot(snapshot_with("R1", None));
        assert!(rec.input_gate());
        // And the move can go out again.
        rec.record_move(3).unwrap();
    }

    #[test]
    fn record_move_does_not_mutate_snapshot() {
        let mut rec = bound("alice", "R1");
        let snapshot = snapshot_with("R1", None);
        rec.apply_snapshot(snapshot.clone());
        rec.record_move(6).unwrap();
        assert_eq!(rec.snapshot(), &snapshot);
    }

    #[test]
    fn identical_snapshot_reapplied_is_harmless() {
        let mut rec = bound("alice", "R1");
        let snapshot = snapshot_with("R1", None);
        rec.apply_snapshot(snapshot.clone());
        rec.apply_snapshot(snapshot.clone());
        assert_eq!(rec.snapshot(), &snapshot);
        assert!(rec.input_gate());
    }

    #[test]
    fn dismissal_reopens_play() {
        let mut rec = bound("alice", "R1");
        rec.apply_snapshot(snapshot_with("R1", None));
        rec.record_move(1).unwrap();

        rec.apply_dismissal(snapshot_with("R1", None));
        assert!(rec.input_gate());
    }

    #[test]
    fn clear_is_idempotent() {
        let mut rec = bound("alice", "R1");
        rec.apply_snapshot(snapshot_with("R1", None));

        rec.clear();
        assert!(rec.snapshot().is_empty());
        assert!(!rec.input_gate());

        rec.clear();
        assert!(rec.snapshot().is_empty());
        assert!(!rec.input_gate());
    }
}
