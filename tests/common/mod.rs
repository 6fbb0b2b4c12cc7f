#![allow(dead_code)]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for Gully Client integration tests.
//!
//! Provides two transport doubles — a scripted [`MockTransport`] and a
//! test-driven [`LoopbackTransport`] whose server half the test controls —
//! plus a scripted rematch prompt, a recording media backend, and helper
//! functions for building server message JSON.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use gully_client::peer::{DecisionPrompt, MediaBackend, PeerConnection};
use gully_client::protocol::{
    ClientMessage, IceCandidate, Participant, RoomSnapshot, RoomState, ServerMessage,
    SessionDescription,
};
use gully_client::{GullyError, Transport};

// ── MockTransport ───────────────────────────────────────────────────

/// A scripted transport: server responses are consumed in order by `recv()`,
/// and everything the client sends is recorded.
pub struct MockTransport {
    /// Scripted server responses (consumed in order by `recv`).
    incoming: VecDeque<Option<Result<String, GullyError>>>,
    /// Recorded outgoing messages from the client.
    pub sent: Arc<StdMutex<Vec<String>>>,
    /// Whether `close()` has been called.
    pub closed: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a new mock transport with the given scripted incoming messages.
    ///
    /// Returns the transport plus shared handles for inspecting sent messages
    /// and whether close was called.
    pub fn new(
        incoming: Vec<Option<Result<String, GullyError>>>,
    ) -> (Self, Arc<StdMutex<Vec<String>>>, Arc<AtomicBool>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            incoming: VecDeque::from(incoming),
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (transport, sent, closed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), GullyError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, GullyError>> {
        if let Some(item) = self.incoming.pop_front() {
            item
        } else {
            // No more scripted messages — hang forever so the event loop
            // stays alive until shutdown is called.
            std::future::pending().await
        }
    }

    async fn close(&mut self) -> Result<(), GullyError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── LoopbackTransport ───────────────────────────────────────────────

/// The test-controlled server half of a [`LoopbackTransport`].
pub struct FakeServer {
    /// Read what the client sent, already deserialized.
    rx: mpsc::UnboundedReceiver<String>,
    /// Push messages to the client (as if from the server).
    tx: mpsc::UnboundedSender<String>,
}

impl FakeServer {
    /// Push a server message to the client.
    pub fn push(&self, json: String) {
        self.tx.send(json).unwrap();
    }

    /// Await the next message the client sent.
    pub async fn next_sent(&mut self) -> ClientMessage {
        let json = self.rx.recv().await.expect("client channel closed");
        serde_json::from_str(&json).expect("client sent invalid JSON")
    }

    /// Return the next message the client sent, if one is already queued.
    pub fn try_next_sent(&mut self) -> Option<ClientMessage> {
        self.rx
            .try_recv()
            .ok()
            .map(|json| serde_json::from_str(&json).expect("client sent invalid JSON"))
    }

    /// Close the server side of the connection.
    pub fn close(self) {
        drop(self.tx);
    }
}

/// A channel-based transport whose remote side the test drives explicitly.
///
/// Unlike [`MockTransport`], the test decides *when* each server message is
/// delivered, which makes command/message ordering deterministic: await the
/// client's outbound message first, then push the server's reply.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create a connected `(transport, server)` pair.
pub fn loopback() -> (LoopbackTransport, FakeServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        },
        FakeServer {
            rx: server_rx,
            tx: server_tx,
        },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), GullyError> {
        self.tx
            .send(message)
            .map_err(|e| GullyError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, GullyError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), GullyError> {
        Ok(())
    }
}

// ── ScriptedPrompt ──────────────────────────────────────────────────

/// A [`DecisionPrompt`] that answers from a scripted queue and records every
/// question it was asked. Runs out of script → declines.
pub struct ScriptedPrompt {
    answers: VecDeque<bool>,
    pub questions: Arc<StdMutex<Vec<String>>>,
}

impl ScriptedPrompt {
    pub fn new(answers: Vec<bool>) -> (Self, Arc<StdMutex<Vec<String>>>) {
        let questions = Arc::new(StdMutex::new(Vec::new()));
        (
            Self {
                answers: VecDeque::from(answers),
                questions: Arc::clone(&questions),
            },
            questions,
        )
    }
}

#[async_trait]
impl DecisionPrompt for ScriptedPrompt {
    async fn confirm(&mut self, question: &str) -> bool {
        self.questions.lock().unwrap().push(question.to_string());
        self.answers.pop_front().unwrap_or(false)
    }
}

// ── Recording media backend ─────────────────────────────────────────

/// Shared record of everything a [`RecordingConn`] was asked to do.
#[derive(Default)]
pub struct ConnLog {
    pub remote_descriptions: StdMutex<Vec<SessionDescription>>,
    pub applied_candidates: StdMutex<Vec<IceCandidate>>,
    pub closed: AtomicBool,
}

/// A peer connection that records operations and fabricates descriptions.
pub struct RecordingConn {
    log: Arc<ConnLog>,
}

#[async_trait]
impl PeerConnection for RecordingConn {
    async fn create_offer(&mut self) -> Result<SessionDescription, GullyError> {
        Ok(SessionDescription::offer("v=0 test-local-offer"))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, GullyError> {
        Ok(SessionDescription::answer("v=0 test-local-answer"))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), GullyError> {
        self.log
            .remote_descriptions
            .lock()
            .unwrap()
            .push(description);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), GullyError> {
        self.log.applied_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&mut self) {
        self.log.closed.store(true, Ordering::Release);
    }
}

/// A media backend that yields [`RecordingConn`]s and exposes the sender half
/// of each connection's local-candidate stream to the test.
pub struct RecordingMedia {
    pub opens: Arc<AtomicUsize>,
    pub logs: Arc<StdMutex<Vec<Arc<ConnLog>>>>,
    pub candidate_txs: Arc<StdMutex<Vec<mpsc::UnboundedSender<IceCandidate>>>>,
    pub deny_capture: bool,
}

impl RecordingMedia {
    pub fn new() -> Self {
        Self {
            opens: Arc::new(AtomicUsize::new(0)),
            logs: Arc::new(StdMutex::new(Vec::new())),
            candidate_txs: Arc::new(StdMutex::new(Vec::new())),
            deny_capture: false,
        }
    }

    pub fn denying() -> Self {
        let mut media = Self::new();
        media.deny_capture = true;
        media
    }
}

#[async_trait]
impl MediaBackend for RecordingMedia {
    type Conn = RecordingConn;

    async fn open(
        &mut self,
    ) -> Result<(RecordingConn, mpsc::UnboundedReceiver<IceCandidate>), GullyError> {
        if self.deny_capture {
            return Err(GullyError::Negotiation("capture device denied".into()));
        }
        self.opens.fetch_add(1, Ordering::Relaxed);
        let log = Arc::new(ConnLog::default());
        self.logs.lock().unwrap().push(Arc::clone(&log));
        let (tx, rx) = mpsc::unbounded_channel();
        self.candidate_txs.lock().unwrap().push(tx);
        Ok((RecordingConn { log }, rx))
    }
}

// ── Snapshot and JSON helper functions ──────────────────────────────

/// Build a two-player snapshot for `room_id` with the given turn owner.
pub fn two_player_snapshot(room_id: &str, turn_owner: Option<&str>) -> RoomSnapshot {
    let mut snapshot = RoomSnapshot::new();
    snapshot.insert(
        room_id.to_string(),
        RoomState {
            participants: vec![
                Participant {
                    identity: "alice".into(),
                    score: 24,
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
            total_score: 24,
        },
    );
    snapshot
}

pub fn room_created_json(room_id: &str) -> String {
    serde_json::to_string(&ServerMessage::RoomCreated {
        room_id: room_id.into(),
    })
    .expect("room_created_json serialization")
}

pub fn room_not_found_json() -> String {
    serde_json::to_string(&ServerMessage::RoomNotFound).expect("room_not_found_json serialization")
}

pub fn room_full_json() -> String {
    serde_json::to_string(&ServerMessage::RoomFull).expect("room_full_json serialization")
}

pub fn playable_now_json(room_id: &str, turn_owner: Option<&str>) -> String {
    serde_json::to_string(&ServerMessage::PlayableNow {
        room_id: room_id.into(),
        snapshot: two_player_snapshot(room_id, turn_owner),
    })
    .expect("playable_now_json serialization")
}

pub fn snapshot_updated_json(room_id: &str, turn_owner: Option<&str>) -> String {
    serde_json::to_string(&ServerMessage::SnapshotUpdated {
        snapshot: two_player_snapshot(room_id, turn_owner),
    })
    .expect("snapshot_updated_json serialization")
}

pub fn dismissal_json(room_id: &str, batting: &str, bowling: &str, final_score: u32) -> String {
    serde_json::to_string(&ServerMessage::Dismissal {
        batting: batting.into(),
        bowling: bowling.into(),
        snapshot: two_player_snapshot(room_id, None),
        final_score,
    })
    .expect("dismissal_json serialization")
}

pub fn match_ended_json(room_id: &str, winner: Option<&str>, draw: bool) -> String {
    serde_json::to_string(&ServerMessage::MatchEnded {
        winner: winner.map(String::from),
        draw,
        snapshot: two_player_snapshot(room_id, None),
        room_id: room_id.into(),
    })
    .expect("match_ended_json serialization")
}

pub fn match_won_json(room_id: &str, winner: &str) -> String {
    serde_json::to_string(&ServerMessage::MatchWon {
        winner: winner.into(),
        room_id: room_id.into(),
    })
    .expect("match_won_json serialization")
}

pub fn rematch_state_json(room_id: &str) -> String {
    serde_json::to_string(&ServerMessage::RematchState {
        snapshot: two_player_snapshot(room_id, None),
    })
    .expect("rematch_state_json serialization")
}

pub fn signal_offer_json(sdp: &str) -> String {
    serde_json::to_string(&ServerMessage::SignalOffer {
        description: SessionDescription::offer(sdp),
    })
    .expect("signal_offer_json serialization")
}

pub fn signal_answer_json(sdp: &str) -> String {
    serde_json::to_string(&ServerMessage::SignalAnswer {
        description: SessionDescription::answer(sdp),
    })
    .expect("signal_answer_json serialization")
}

pub fn signal_candidate_json(line: &str) -> String {
    serde_json::to_string(&ServerMessage::SignalCandidate {
        candidate: candidate(line),
    })
    .expect("signal_candidate_json serialization")
}

/// Build a candidate with the given line.
pub fn candidate(line: &str) -> IceCandidate {
    IceCandidate {
        candidate: line.into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}
