#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for the match lifecycle and session reconciliation.
//!
//! Uses the `LoopbackTransport` from `tests/common` so each test drives the
//! server side explicitly: await the client's outbound message, then push
//! the server's reply. That keeps command/message ordering deterministic.

mod common;

use std::time::Duration;

use gully_client::protocol::ClientMessage;
use gully_client::{
    GullyClient, GullyConfig, GullyError, GullyEvent, MatchOutcome, MatchPhase, NoMedia, PlayMode,
};

use common::{
    dismissal_json, loopback, match_ended_json, match_won_json, playable_now_json,
    rematch_state_json, room_created_json, room_full_json, room_not_found_json,
    snapshot_updated_json, FakeServer, MockTransport, ScriptedPrompt,
};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

/// Start a client over a loopback pair with scripted rematch answers.
fn start_client(
    rematch_answers: Vec<bool>,
) -> (
    GullyClient,
    tokio::sync::mpsc::Receiver<GullyEvent>,
    FakeServer,
    std::sync::Arc<std::sync::Mutex<Vec<String>>>,
) {
    let (transport, server) = loopback();
    let (prompt, questions) = ScriptedPrompt::new(rematch_answers);
    let (client, events) = GullyClient::start(transport, NoMedia, prompt, GullyConfig::new());
    (client, events, server, questions)
}

/// Drain the synthetic Connected event.
async fn drain_connected(rx: &mut tokio::sync::mpsc::Receiver<GullyEvent>) {
    let ev = rx.recv().await.expect("expected Connected event");
    assert!(
        matches!(ev, GullyEvent::Connected),
        "first event should be Connected, got {ev:?}"
    );
}

/// Register, pick multiplayer, create a room and play it to `InMatch`.
/// Consumes the RoomCreated and MatchStarted events.
async fn into_match(
    client: &GullyClient,
    events: &mut tokio::sync::mpsc::Receiver<GullyEvent>,
    server: &mut FakeServer,
    turn_owner: Option<&str>,
) {
    client.register("alice").expect("register");
    client.select_mode(PlayMode::Multiplayer).expect("mode");
    client.create_room().expect("create_room");

    let sent = server.next_sent().await;
    assert!(matches!(sent, ClientMessage::CreateRoom { identity } if identity == "alice"));

    server.push(room_created_json("R1"));
    let ev = events.recv().await.expect("event");
    assert!(matches!(ev, GullyEvent::RoomCreated { ref room_id } if room_id == "R1"));

    server.push(playable_now_json("R1", turn_owner));
    let ev = events.recv().await.expect("event");
    assert!(matches!(ev, GullyEvent::MatchStarted { ref room_id, .. } if room_id == "R1"));
}

// ════════════════════════════════════════════════════════════════════
// Room creation flow
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn create_room_flow_reaches_match() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    client.register("alice").unwrap();
    client.select_mode(PlayMode::Multiplayer).unwrap();
    client.create_room().unwrap();

    // The create intent carries the identity.
    let sent = server.next_sent().await;
    assert!(matches!(sent, ClientMessage::CreateRoom { identity } if identity == "alice"));

    // The identifier event pins the room.
    server.push(room_created_json("R1"));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::RoomCreated { ref room_id } if room_id == "R1"));
    assert_eq!(client.current_room_id().await.as_deref(), Some("R1"));
    assert_eq!(client.phase().await, MatchPhase::RoomReady);

    // Playable snapshot with alice to act starts the match.
    server.push(playable_now_json("R1", Some("alice")));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::MatchStarted { ref room_id, .. } if room_id == "R1"));
    assert_eq!(client.phase().await, MatchPhase::InMatch);
    // Gate derives from the snapshot's turn owner matching our identity.
    assert!(client.input_gate());

    client.shutdown().await;
}

#[tokio::test]
async fn playable_with_peer_turn_keeps_gate_closed() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, Some("bob")).await;
    assert!(!client.input_gate());

    client.shutdown().await;
}

#[tokio::test]
async fn duplicate_playable_refreshes_without_restarting() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;

    // A duplicate delivery must not produce a second MatchStarted.
    server.push(playable_now_json("R1", None));
    let ev = events.recv().await.unwrap();
    assert!(
        matches!(ev, GullyEvent::SnapshotUpdated { .. }),
        "duplicate playable-now should surface as a snapshot refresh, got {ev:?}"
    );
    assert_eq!(client.phase().await, MatchPhase::InMatch);

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Join flow and transient room errors
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_room_not_found_is_transient() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    client.register("bob").unwrap();
    client.select_mode(PlayMode::Multiplayer).unwrap();
    client.join_room("NOPE").unwrap();

    let sent = server.next_sent().await;
    assert!(matches!(
        sent,
        ClientMessage::JoinRoom { identity, room_id } if identity == "bob" && room_id == "NOPE"
    ));

    server.push(room_not_found_json());
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::RoomNotFound));
    // The phase is untouched — the player can retry immediately.
    assert_eq!(client.phase().await, MatchPhase::ModeSelecting);

    // Retry with the right identifier.
    client.join_room("R1").unwrap();
    let _ = server.next_sent().await;
    server.push(playable_now_json("R1", None));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::MatchStarted { .. }));

    client.shutdown().await;
}

#[tokio::test]
async fn room_full_is_transient() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    client.register("carol").unwrap();
    client.select_mode(PlayMode::Multiplayer).unwrap();
    client.join_room("R1").unwrap();
    let _ = server.next_sent().await;

    server.push(room_full_json());
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::RoomFull));
    assert_eq!(client.phase().await, MatchPhase::ModeSelecting);

    client.shutdown().await;
}

#[tokio::test]
async fn stale_room_error_after_match_start_is_swallowed() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;

    // A late room-full can no longer apply; nothing should surface.
    server.push(room_full_json());
    server.push(snapshot_updated_json("R1", None));

    let ev = events.recv().await.unwrap();
    assert!(
        matches!(ev, GullyEvent::SnapshotUpdated { .. }),
        "stale room error must not surface, got {ev:?}"
    );

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Move gating
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn move_closes_gate_until_next_snapshot() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;
    assert!(client.input_gate());

    client.submit_move(4).unwrap();
    let sent = server.next_sent().await;
    assert!(matches!(
        sent,
        ClientMessage::SubmitMove { room_id, value } if room_id == "R1" && value == 4
    ));

    // Let the loop finish the dispatch so the mirror reflects the closed gate.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!client.input_gate());

    // A second move before the snapshot must be suppressed.
    let err = client.submit_move(6).unwrap_err();
    assert!(matches!(err, GullyError::InputGated));

    // The snapshot refresh reopens the gate.
    server.push(snapshot_updated_json("R1", None));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::SnapshotUpdated { .. }));
    assert!(client.input_gate());

    client.submit_move(6).unwrap();
    let sent = server.next_sent().await;
    assert!(matches!(sent, ClientMessage::SubmitMove { value, .. } if value == 6));

    client.shutdown().await;
}

#[tokio::test]
async fn snapshot_with_peer_turn_keeps_gate_closed_after_move() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;
    client.submit_move(2).unwrap();
    let _ = server.next_sent().await;

    // The server hands the turn to the peer: the gate stays shut.
    server.push(snapshot_updated_json("R1", Some("bob")));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::SnapshotUpdated { .. }));
    assert!(!client.input_gate());

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Dismissal
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn dismissal_notifies_and_reopens_play() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;
    client.submit_move(3).unwrap();
    let _ = server.next_sent().await;

    server.push(dismissal_json("R1", "alice", "bob", 24));
    let ev = events.recv().await.unwrap();
    if let GullyEvent::Dismissal {
        batting,
        bowling,
        final_score,
        ..
    } = ev
    {
        assert_eq!(batting, "alice");
        assert_eq!(bowling, "bob");
        assert_eq!(final_score, 24);
    } else {
        panic!("expected Dismissal, got {ev:?}");
    }
    // Informational only — play continues.
    assert!(client.input_gate());
    assert_eq!(client.phase().await, MatchPhase::InMatch);

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Match end, rematch, reset
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn declined_rematch_resets_everything() {
    let (mut client, mut events, mut server, questions) = start_client(vec![false]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;

    server.push(match_ended_json("R1", Some("bob"), false));
    let ev = events.recv().await.unwrap();
    assert!(matches!(
        ev,
        GullyEvent::MatchEnded { outcome: MatchOutcome::Winner(ref w) } if w == "bob"
    ));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::MatchReset));

    // Full local reset: phase back to Registered, identity cleared,
    // snapshot emptied, gate shut.
    assert_eq!(client.phase().await, MatchPhase::Registered);
    assert!(client.current_identity().await.is_none());
    assert!(client.current_room_id().await.is_none());
    assert!(client.snapshot().await.is_empty());
    assert!(!client.input_gate());

    // The question named the winner.
    assert!(questions.lock().unwrap()[0].contains("bob"));

    client.shutdown().await;
}

#[tokio::test]
async fn declined_rematch_reset_is_idempotent() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![false, false]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;

    // Duplicate match-end delivery: the second must be absorbed.
    server.push(match_ended_json("R1", Some("bob"), false));
    server.push(match_ended_json("R1", Some("bob"), false));
    server.push(snapshot_updated_json("R2", None));

    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::MatchEnded { .. }));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::MatchReset));
    // The duplicate produced no second MatchEnded/MatchReset pair; the next
    // event is the unrelated snapshot push.
    let ev = events.recv().await.unwrap();
    assert!(
        matches!(ev, GullyEvent::SnapshotUpdated { .. }),
        "duplicate match-end must be absorbed, got {ev:?}"
    );

    assert_eq!(client.phase().await, MatchPhase::Registered);
    assert!(client.current_identity().await.is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn draw_prompts_with_draw_wording() {
    let (mut client, mut events, mut server, questions) = start_client(vec![false]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;

    server.push(match_ended_json("R1", None, true));
    let ev = events.recv().await.unwrap();
    assert!(matches!(
        ev,
        GullyEvent::MatchEnded {
            outcome: MatchOutcome::Draw
        }
    ));

    assert!(questions.lock().unwrap()[0].contains("drawn"));

    client.shutdown().await;
}

#[tokio::test]
async fn accepted_rematch_requests_same_room_and_restarts() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![true]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;

    server.push(match_won_json("R1", "alice"));
    let ev = events.recv().await.unwrap();
    assert!(matches!(
        ev,
        GullyEvent::MatchEnded { outcome: MatchOutcome::Winner(ref w) } if w == "alice"
    ));

    // Accepting sends the play-again intent for the same room.
    let sent = server.next_sent().await;
    assert!(matches!(sent, ClientMessage::Rematch { room_id } if room_id == "R1"));
    // And the phase holds at Finished until the server pushes fresh state.
    assert_eq!(client.phase().await, MatchPhase::Finished);
    // Identity survives an accepted rematch.
    assert_eq!(client.current_identity().await.as_deref(), Some("alice"));

    server.push(rematch_state_json("R1"));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::RematchStarted { .. }));
    assert_eq!(client.phase().await, MatchPhase::InMatch);
    assert!(client.input_gate());

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Singleplayer flow
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn singleplayer_reaches_match_without_room_dialog() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    client.register("alice").unwrap();
    client.select_mode(PlayMode::SinglePlayer).unwrap();

    let sent = server.next_sent().await;
    assert!(matches!(sent, ClientMessage::PlayVsAutomated { identity } if identity == "alice"));

    server.push(playable_now_json("CPU-7", None));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::MatchStarted { ref room_id, .. } if room_id == "CPU-7"));
    assert_eq!(client.phase().await, MatchPhase::InMatch);

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Transport failure
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn transport_error_surfaces_disconnected() {
    let (transport, _sent, _closed) = MockTransport::new(vec![Some(Err(
        GullyError::TransportReceive("wire torn".into()),
    ))]);
    let (prompt, _questions) = ScriptedPrompt::new(vec![]);
    let (mut client, mut events) =
        GullyClient::start(transport, NoMedia, prompt, GullyConfig::new());

    drain_connected(&mut events).await;

    let ev = events.recv().await.unwrap();
    if let GullyEvent::Disconnected { reason } = ev {
        assert!(reason.unwrap().contains("wire torn"));
    } else {
        panic!("expected Disconnected, got {ev:?}");
    }
    assert!(!client.is_connected());

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Snapshot wholesale replacement
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn snapshot_is_replaced_wholesale() {
    let (mut client, mut events, mut server, _questions) = start_client(vec![]);
    drain_connected(&mut events).await;

    into_match(&client, &mut events, &mut server, None).await;

    // A later snapshot that no longer contains R1 wins outright.
    server.push(snapshot_updated_json("OTHER", None));
    let ev = events.recv().await.unwrap();
    assert!(matches!(ev, GullyEvent::SnapshotUpdated { .. }));

    let snapshot = client.snapshot().await;
    assert!(!snapshot.contains_key("R1"));
    assert!(snapshot.contains_key("OTHER"));
    // Our room vanished from the authoritative state: input is closed.
    assert!(!client.input_gate());

    client.shutdown().await;
}
