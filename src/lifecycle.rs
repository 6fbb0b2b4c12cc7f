//! Match lifecycle state machine.
//!
//! [`MatchLifecycle`] owns the local player's identity and the current
//! [`MatchPhase`], and converts user intents into outbound
//! [`ClientMessage`]s. It performs no I/O itself — the client loop sends
//! whatever messages the transitions yield, which keeps every transition
//! synchronous and deterministic under test.
//!
//! Inbound authoritative events are applied through the `on_*` methods.
//! Each of those absorbs stale or duplicate delivery: an event that arrives
//! in a phase that does not permit it is reported as such and otherwise
//! ignored, never fatal.

use tracing::{debug, warn};

use crate::error::{GullyError, Result};
use crate::protocol::{ClientMessage, Identity, RoomId};

/// The phase of the local match lifecycle. Exactly one is active at a time.
///
/// Transitions are one-directional except `Finished → Registered` (rematch
/// declined) and `Finished → InMatch` (rematch accepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPhase {
    /// No identity chosen yet.
    #[default]
    Unregistered,
    /// Identity chosen; no mode selected.
    Registered,
    /// Mode chosen; multiplayer room dialog (or singleplayer reply) pending.
    ModeSelecting,
    /// Create-room intent sent; waiting for the server-assigned identifier.
    RoomPending,
    /// Room identifier confirmed; waiting for a second participant.
    RoomReady,
    /// Match in progress.
    InMatch,
    /// Match over; rematch decision taken or pending server state.
    Finished,
}

/// Play mode selected after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    /// Play against the server's automated opponent.
    SinglePlayer,
    /// Play against another person in a room.
    Multiplayer,
}

/// Disposition of an inbound playable-now event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayableDisposition {
    /// First delivery: the match has started. UI-level side effects fire.
    Entered,
    /// Duplicate delivery while already in the match: refresh the snapshot
    /// only, repeat no side effects.
    Refreshed,
    /// Delivery in a phase that cannot accept it. Dropped.
    Stale,
}

/// State machine for the local player's match lifecycle.
#[derive(Debug, Default)]
pub struct MatchLifecycle {
    phase: MatchPhase,
    identity: Option<Identity>,
    room_id: Option<RoomId>,
}

impl MatchLifecycle {
    /// Create a lifecycle in the `Unregistered` phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// The registered identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// The current room identifier, once assigned by the server.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    // ── User intents ────────────────────────────────────────────────

    /// Register the local identity. No network effect.
    ///
    /// Valid in `Unregistered`, and in the post-reset `Registered` phase
    /// where the previous identity has been cleared.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::PhaseViolation`] in any other phase.
    pub fn register(&mut self, identity: impl Into<Identity>) -> Result<()> {
        let rename_allowed =
            self.phase == MatchPhase::Registered && self.identity.is_none();
        if self.phase != MatchPhase::Unregistered && !rename_allowed {
            return Err(GullyError::PhaseViolation { phase: self.phase });
        }
        self.identity = Some(identity.into());
        self.phase = MatchPhase::Registered;
        debug!("lifecycle: registered");
        Ok(())
    }

    /// Select a play mode.
    ///
    /// Singleplayer immediately yields the play-vs-automated intent; the
    /// server replies with a playable snapshot that moves the phase to
    /// `InMatch`. Multiplayer yields nothing — a room must be created or
    /// joined next.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::PhaseViolation`] outside `Registered`.
    pub fn select_mode(&mut self, mode: PlayMode) -> Result<Option<ClientMessage>> {
        if self.phase != MatchPhase::Registered {
            return Err(GullyError::PhaseViolation { phase: self.phase });
        }
        let identity = self.require_identity()?;
        self.phase = MatchPhase::ModeSelecting;
        debug!(?mode, "lifecycle: mode selected");
        Ok(match mode {
            PlayMode::SinglePlayer => Some(ClientMessage::PlayVsAutomated { identity }),
            PlayMode::Multiplayer => None,
        })
    }

    /// Request a new room. Phase advances to `RoomPending` optimistically;
    /// the identifier arrives with the room-created event.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::PhaseViolation`] outside `ModeSelecting`.
    pub fn create_room(&mut self) -> Result<ClientMessage> {
        if self.phase != MatchPhase::ModeSelecting {
            return Err(GullyError::PhaseViolation { phase: self.phase });
        }
        let identity = self.require_identity()?;
        self.phase = MatchPhase::RoomPending;
        debug!("lifecycle: create-room intent");
        Ok(ClientMessage::CreateRoom { identity })
    }

    /// Request to join an existing room. The phase does not change until the
    /// server answers with either a room error or a playable snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::PhaseViolation`] outside `ModeSelecting`.
    pub fn join_room(&mut self, target: impl Into<RoomId>) -> Result<ClientMessage> {
        if self.phase != MatchPhase::ModeSelecting {
            return Err(GullyError::PhaseViolation { phase: self.phase });
        }
        let identity = self.require_identity()?;
        debug!("lifecycle: join-room intent");
        Ok(ClientMessage::JoinRoom {
            identity,
            room_id: target.into(),
        })
    }

    // ── Inbound authoritative events ────────────────────────────────

    /// Apply an inbound room-created event. Returns `true` when the
    /// identifier was accepted (phase `RoomPending` → `RoomReady`).
    pub fn on_room_created(&mut self, room_id: RoomId) -> bool {
        if self.phase != MatchPhase::RoomPending {
            warn!(phase = ?self.phase, "stale room-created event ignored");
            return false;
        }
        debug!(%room_id, "lifecycle: room confirmed");
        self.room_id = Some(room_id);
        self.phase = MatchPhase::RoomReady;
        true
    }

    /// Apply an inbound room-not-found / room-full event. Returns `true`
    /// when the notice should be surfaced to the user: a create or join is
    /// plausibly outstanding. The phase never changes either way.
    pub fn on_room_error(&mut self) -> bool {
        match self.phase {
            MatchPhase::ModeSelecting | MatchPhase::RoomPending => true,
            phase => {
                warn!(?phase, "stale room error ignored");
                false
            }
        }
    }

    /// Apply an inbound playable-now event.
    ///
    /// Valid from `ModeSelecting` (join or singleplayer reply),
    /// `RoomPending` and `RoomReady`; those move the phase to `InMatch` and
    /// pin the room identifier. A duplicate delivery while already `InMatch`
    /// refreshes the snapshot only.
    pub fn on_playable(&mut self, room_id: RoomId) -> PlayableDisposition {
        match self.phase {
            MatchPhase::ModeSelecting | MatchPhase::RoomPending | MatchPhase::RoomReady => {
                debug!(%room_id, "lifecycle: match started");
                self.room_id = Some(room_id);
                self.phase = MatchPhase::InMatch;
                PlayableDisposition::Entered
            }
            MatchPhase::InMatch => PlayableDisposition::Refreshed,
            phase => {
                warn!(?phase, "stale playable-now event ignored");
                PlayableDisposition::Stale
            }
        }
    }

    /// Apply an inbound match-end event. Returns `true` when accepted
    /// (`InMatch` → `Finished`); a duplicate or stale delivery is ignored.
    pub fn on_match_end(&mut self) -> bool {
        if self.phase != MatchPhase::InMatch {
            warn!(phase = ?self.phase, "stale match-end event ignored");
            return false;
        }
        debug!("lifecycle: match finished");
        self.phase = MatchPhase::Finished;
        true
    }

    /// Yield the play-again intent for the current room. The phase stays
    /// `Finished` until the server pushes fresh rematch state.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::PhaseViolation`] outside `Finished`, or
    /// [`GullyError::NotInRoom`] if no room identifier is known.
    pub fn rematch(&mut self) -> Result<ClientMessage> {
        if self.phase != MatchPhase::Finished {
            return Err(GullyError::PhaseViolation { phase: self.phase });
        }
        let room_id = self.room_id.clone().ok_or(GullyError::NotInRoom)?;
        debug!(%room_id, "lifecycle: rematch intent");
        Ok(ClientMessage::Rematch { room_id })
    }

    /// Apply the fresh state push that starts an accepted rematch. Returns
    /// `true` when the phase moved `Finished` → `InMatch`.
    pub fn on_rematch_state(&mut self) -> bool {
        if self.phase != MatchPhase::Finished {
            warn!(phase = ?self.phase, "stale rematch-state event ignored");
            return false;
        }
        debug!("lifecycle: rematch started");
        self.phase = MatchPhase::InMatch;
        true
    }

    /// Full local reset after a declined rematch: identity and room cleared,
    /// phase back to `Registered`. Idempotent.
    pub fn reset(&mut self) {
        self.identity = None;
        self.room_id = None;
        self.phase = MatchPhase::Registered;
        debug!("lifecycle: reset");
    }

    fn require_identity(&self) -> Result<Identity> {
        self.identity
            .clone()
            .ok_or(GullyError::PhaseViolation { phase: self.phase })
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

    fn registered(identity: &str) -> MatchLifecycle {
        let mut lc = MatchLifecycle::new();
        lc.register(identity).unwrap();
        lc
    }

    #[test]
    fn register_transitions_to_registered() {
        let lc = registered("alice");
        assert_eq!(lc.phase(), MatchPhase::Registered);
        assert_eq!(lc.identity().map(String::as_str), Some("alice"));
    }

    #[test]
    fn register_twice_is_rejected() {
        let mut lc = registered("alice");
        let err = lc.register("bob").unwrap_err();
        assert!(matches!(err, GullyError::PhaseViolation { .. }));
    }

    #[test]
    fn singleplayer_mode_yields_automated_intent() {
        let mut lc = registered("alice");
        let msg = lc.select_mode(PlayMode::SinglePlayer).unwrap();
        assert!(matches!(
            msg,
            Some(ClientMessage::PlayVsAutomated { identity }) if identity == "alice"
        ));
        assert_eq!(lc.phase(), MatchPhase::ModeSelecting);
    }

    #[test]
    fn multiplayer_mode_yields_nothing() {
        let mut lc = registered("alice");
        let msg = lc.select_mode(PlayMode::Multiplayer).unwrap();
        assert!(msg.is_none());
        assert_eq!(lc.phase(), MatchPhase::ModeSelecting);
    }

    #[test]
    fn create_room_is_optimistic() {
        let mut lc = registered("alice");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        let msg = lc.create_room().unwrap();
        assert!(matches!(msg, ClientMessage::CreateRoom { identity } if identity == "alice"));
        assert_eq!(lc.phase(), MatchPhase::RoomPending);
        // Identifier not yet known.
        assert!(lc.room_id().is_none());
    }

    #[test]
    fn room_created_confirms_identifier() {
        let mut lc = registered("alice");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        lc.create_room().unwrap();
        assert!(lc.on_room_created("R1".into()));
        assert_eq!(lc.phase(), MatchPhase::RoomReady);
        assert_eq!(lc.room_id().map(String::as_str), Some("R1"));
    }

    #[test]
    fn stale_room_created_is_ignored() {
        let mut lc = registered("alice");
        assert!(!lc.on_room_created("R1".into()));
        assert_eq!(lc.phase(), MatchPhase::Registered);
        assert!(lc.room_id().is_none());
    }

    #[test]
    fn join_room_keeps_phase() {
        let mut lc = registered("bob");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        let msg = lc.join_room("R1").unwrap();
        assert!(matches!(
            msg,
            ClientMessage::JoinRoom { identity, room_id } if identity == "bob" && room_id == "R1"
        ));
        assert_eq!(lc.phase(), MatchPhase::ModeSelecting);
    }

    #[test]
    fn room_error_surfaces_only_while_pending() {
        let mut lc = registered("bob");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        assert!(lc.on_room_error());

        lc.on_playable("R1".into());
        // Phase advanced past the room dialog — stale error is swallowed.
        assert!(!lc.on_room_error());
        assert_eq!(lc.phase(), MatchPhase::InMatch);
    }

    #[test]
    fn playable_from_room_ready_enters_match() {
        let mut lc = registered("alice");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        lc.create_room().unwrap();
        lc.on_room_created("R1".into());
        assert_eq!(lc.on_playable("R1".into()), PlayableDisposition::Entered);
        assert_eq!(lc.phase(), MatchPhase::InMatch);
    }

    #[test]
    fn duplicate_playable_refreshes_without_side_effects() {
        let mut lc = registered("alice");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        assert_eq!(lc.on_playable("R1".into()), PlayableDisposition::Entered);
        assert_eq!(lc.on_playable("R1".into()), PlayableDisposition::Refreshed);
        assert_eq!(lc.phase(), MatchPhase::InMatch);
    }

    #[test]
    fn playable_before_registration_is_stale() {
        let mut lc = MatchLifecycle::new();
        assert_eq!(lc.on_playable("R1".into()), PlayableDisposition::Stale);
        assert_eq!(lc.phase(), MatchPhase::Unregistered);
    }

    #[test]
    fn match_end_then_rematch_intent() {
        let mut lc = registered("alice");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        lc.on_playable("R1".into());
        assert!(lc.on_match_end());
        assert_eq!(lc.phase(), MatchPhase::Finished);

        let msg = lc.rematch().unwrap();
        assert!(matches!(msg, ClientMessage::Rematch { room_id } if room_id == "R1"));
        // Stays Finished until the server pushes fresh state.
        assert_eq!(lc.phase(), MatchPhase::Finished);

        assert!(lc.on_rematch_state());
        assert_eq!(lc.phase(), MatchPhase::InMatch);
    }

    #[test]
    fn duplicate_match_end_is_ignored() {
        let mut lc = registered("alice");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        lc.on_playable("R1".into());
        assert!(lc.on_match_end());
        assert!(!lc.on_match_end());
        assert_eq!(lc.phase(), MatchPhase::Finished);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut lc = registered("alice");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        lc.on_playable("R1".into());
        lc.on_match_end();

        lc.reset();
        let after_once = (lc.phase(), lc.identity().cloned(), lc.room_id().cloned());
        lc.reset();
        let after_twice = (lc.phase(), lc.identity().cloned(), lc.room_id().cloned());

        assert_eq!(after_once, after_twice);
        assert_eq!(lc.phase(), MatchPhase::Registered);
        assert!(lc.identity().is_none());
        assert!(lc.room_id().is_none());
    }

    #[test]
    fn register_allowed_again_after_reset() {
        let mut lc = registered("alice");
        lc.select_mode(PlayMode::Multiplayer).unwrap();
        lc.on_playable("R1".into());
        lc.on_match_end();
        lc.reset();

        lc.register("carol").unwrap();
        assert_eq!(lc.identity().map(String::as_str), Some("carol"));
        assert_eq!(lc.phase(), MatchPhase::Registered);
    }
}
