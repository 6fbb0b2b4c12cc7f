//! Peer signaling coordination for the voice connection.
//!
//! [`SignalingCoordinator`] owns the one peer connection of a match session
//! and walks it through standard offer/answer negotiation. Session
//! descriptions and network candidates both arrive over the same ordered
//! server channel, but the two kinds are produced by independently-suspended
//! handler chains on the remote side, so a candidate can outrun the
//! description it belongs to. Candidates that arrive before any remote
//! description is set are therefore buffered in arrival order and replayed
//! exactly once, immediately after the description lands.
//!
//! Every inbound handler re-checks the current state at entry and degrades
//! to a logged no-op on anything the state does not permit — a stale answer
//! or a glare offer is dropped, never an error for the session.
//!
//! Nothing here runs until the local participant explicitly initializes
//! voice: consent gates connection work, not bookkeeping.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{GullyError, Result};
use crate::peer::{MediaBackend, PeerConnection};
use crate::protocol::{ClientMessage, IceCandidate, SessionDescription};

/// Offer/answer negotiation state. Private to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SignalingState {
    /// No negotiation in progress.
    #[default]
    Idle,
    /// We sent an offer and await the peer's answer.
    HaveLocalOffer,
    /// We received the peer's offer and answered it.
    HaveRemoteOffer,
    /// Both descriptions applied; candidates flow directly.
    Stable,
}

/// Drives one peer connection through offer/answer negotiation.
///
/// Owned by the client loop; activated only while a match is in progress and
/// only on explicit user intent.
pub struct SignalingCoordinator<B: MediaBackend> {
    backend: B,
    conn: Option<B::Conn>,
    state: SignalingState,
    /// True once a remote description has been applied to `conn`.
    remote_description_set: bool,
    /// Candidates received before the remote description, in arrival order.
    pending_candidates: Vec<IceCandidate>,
    /// Locally-gathered candidates, produced by the backend while gathering.
    local_candidates: Option<mpsc::UnboundedReceiver<IceCandidate>>,
}

impl<B: MediaBackend> SignalingCoordinator<B> {
    /// Create an idle coordinator around the given backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            conn: None,
            state: SignalingState::default(),
            remote_description_set: false,
            pending_candidates: Vec::new(),
            local_candidates: None,
        }
    }

    /// Whether a peer connection currently exists.
    pub fn is_active(&self) -> bool {
        self.conn.is_some()
    }

    /// Acquire the capture device and build the peer connection.
    ///
    /// Calling this while a connection exists tears the old one down and
    /// rebuilds, rather than leaking a duplicate. Must complete before
    /// [`create_offer`](Self::create_offer) is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::Negotiation`] when the capture device is denied
    /// or the media stack fails; the coordinator is left idle with no
    /// connection in that case.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.conn.is_some() {
            debug!("signaling: reinitialize requested, tearing down first");
            self.teardown().await;
        }
        let (conn, local_rx) = self.backend.open().await?;
        self.conn = Some(conn);
        self.local_candidates = Some(local_rx);
        self.state = SignalingState::Idle;
        self.remote_description_set = false;
        debug!("signaling: initialized");
        Ok(())
    }

    /// Release the peer connection and return to idle. Safe to call when no
    /// connection exists.
    pub async fn teardown(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
            debug!("signaling: connection closed");
        }
        self.local_candidates = None;
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.state = SignalingState::Idle;
    }

    /// Start negotiation: create a local offer and yield it for sending.
    ///
    /// Only valid while idle; any other state means negotiation is already
    /// under way and the intent is dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::Negotiation`] when called before
    /// [`initialize`](Self::initialize) completed, or when the media stack
    /// rejects offer creation.
    pub async fn create_offer(&mut self) -> Result<Option<ClientMessage>> {
        if self.state != SignalingState::Idle {
            warn!(state = ?self.state, "create-offer intent ignored: already negotiating");
            return Ok(None);
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| GullyError::Negotiation("voice not initialized".into()))?;
        let offer = conn.create_offer().await?;
        self.state = SignalingState::HaveLocalOffer;
        debug!("signaling: local offer created");
        Ok(Some(ClientMessage::SignalOffer { description: offer }))
    }

    /// Handle an inbound offer from the peer.
    ///
    /// While idle with an initialized connection: apply the remote
    /// description, drain the candidate buffer, then create and yield the
    /// answer. A second offer during our own negotiation is glare and is
    /// dropped; an offer before the local participant enabled voice is
    /// dropped too — the coordinator never auto-connects.
    pub async fn handle_offer(
        &mut self,
        description: SessionDescription,
    ) -> Result<Option<ClientMessage>> {
        match self.state {
            SignalingState::Idle => {}
            SignalingState::HaveLocalOffer => {
                warn!("inbound offer ignored: glare (local offer outstanding)");
                return Ok(None);
            }
            state => {
                warn!(?state, "inbound offer ignored");
                return Ok(None);
            }
        }
        let Some(conn) = self.conn.as_mut() else {
            warn!("inbound offer ignored: voice not initialized");
            return Ok(None);
        };

        if let Err(e) = conn.set_remote_description(description).await {
            warn!("failed to apply remote offer: {e}");
            return Ok(None);
        }
        self.remote_description_set = true;
        self.state = SignalingState::HaveRemoteOffer;
        self.drain_candidate_buffer().await;

        // Answer creation failures are logged, not fatal: the remote
        // description is applied and buffered candidates already flowed.
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        match conn.create_answer().await {
            Ok(answer) => {
                debug!("signaling: answer created");
                Ok(Some(ClientMessage::SignalAnswer {
                    description: answer,
                }))
            }
            Err(e) => {
                warn!("failed to create answer: {e}");
                Ok(None)
            }
        }
    }

    /// Handle an inbound answer from the peer.
    ///
    /// Only meaningful while a local offer is outstanding; an answer in any
    /// other state (including idle, with no prior offer) is dropped.
    pub async fn handle_answer(&mut self, description: SessionDescription) -> Result<()> {
        if self.state != SignalingState::HaveLocalOffer {
            warn!(state = ?self.state, "inbound answer ignored");
            return Ok(());
        }
        let Some(conn) = self.conn.as_mut() else {
            warn!("inbound answer ignored: no connection");
            return Ok(());
        };
        if let Err(e) = conn.set_remote_description(description).await {
            warn!("failed to apply remote answer: {e}");
            return Ok(());
        }
        self.remote_description_set = true;
        self.state = SignalingState::Stable;
        self.drain_candidate_buffer().await;
        debug!("signaling: stable");
        Ok(())
    }

    /// Handle an inbound network candidate from the peer.
    ///
    /// Applied directly once a remote description is set; buffered in
    /// arrival order otherwise. Application failures are logged per
    /// candidate and never abort anything.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_description_set {
            if let Some(conn) = self.conn.as_mut() {
                if let Err(e) = conn.add_remote_candidate(candidate).await {
                    warn!("failed to apply candidate: {e}");
                }
                return;
            }
        }
        debug!("signaling: candidate buffered");
        self.pending_candidates.push(candidate);
    }

    /// Yield the next locally-gathered candidate for outbound relay.
    ///
    /// Pends forever while voice is inactive, which makes it safe to poll
    /// unconditionally from a `select!` loop. Returns `None` exactly once,
    /// when the backend finishes gathering.
    pub async fn next_local_candidate(&mut self) -> Option<IceCandidate> {
        match self.local_candidates.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(candidate) => Some(candidate),
                None => {
                    // Gathering complete; stop polling this receiver.
                    self.local_candidates = None;
                    None
                }
            },
            None => std::future::pending().await,
        }
    }

    /// Apply every buffered candidate in arrival order. Runs exactly once
    /// per negotiation, immediately after the remote description is set;
    /// individual failures do not abort the drain.
    async fn drain_candidate_buffer(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let buffered = std::mem::take(&mut self.pending_candidates);
        if buffered.is_empty() {
            return;
        }
        debug!(count = buffered.len(), "signaling: draining candidate buffer");
        for candidate in buffered {
            if let Err(e) = conn.add_remote_candidate(candidate).await {
                warn!("failed to apply buffered candidate: {e}");
            }
        }
    }
}

impl<B: MediaBackend> std::fmt::Debug for SignalingCoordinator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingCoordinator")
            .field("active", &self.is_active())
            .field("state", &self.state)
            .field("buffered_candidates", &self.pending_candidates.len())
            .finish()
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
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    /// Shared recording of everything a mock connection was asked to do.
    #[derive(Default)]
    struct ConnLog {
        remote_descriptions: StdMutex<Vec<SessionDescription>>,
        applied_candidates: StdMutex<Vec<IceCandidate>>,
        closed: AtomicBool,
    }

    struct MockConn {
        log: Arc<ConnLog>,
        fail_candidate: Option<String>,
    }

    #[async_trait]
    impl PeerConnection for MockConn {
        async fn create_offer(&mut self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("v=0 local-offer"))
        }

        async fn create_answer(&mut self) -> Result<SessionDescription> {
            if self.log.remote_descriptions.lock().unwrap().is_empty() {
                return Err(GullyError::Negotiation(
                    "answer requested before remote description".into(),
                ));
            }
            Ok(SessionDescription::answer("v=0 local-answer"))
        }

        async fn set_remote_description(
            &mut self,
            description: SessionDescription,
        ) -> Result<()> {
            self.log.remote_descriptions.lock().unwrap().push(description);
            Ok(())
        }

        async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
            if let Some(marker) = &self.fail_candidate {
                if candidate.candidate.contains(marker.as_str()) {
                    return Err(GullyError::Negotiation("candidate rejected".into()));
                }
            }
            self.log.applied_candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn close(&mut self) {
            self.log.closed.store(true, Ordering::Release);
        }
    }

    struct MockBackend {
        opens: Arc<AtomicUsize>,
        logs: Arc<StdMutex<Vec<Arc<ConnLog>>>>,
        deny_capture: bool,
        fail_candidate: Option<String>,
    }

    impl MockBackend {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<StdMutex<Vec<Arc<ConnLog>>>>) {
            let opens = Arc::new(AtomicUsize::new(0));
            let logs = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    opens: Arc::clone(&opens),
                    logs: Arc::clone(&logs),
                    deny_capture: false,
                    fail_candidate: None,
                },
                opens,
                logs,
            )
        }
    }

    #[async_trait]
    impl MediaBackend for MockBackend {
        type Conn = MockConn;

        async fn open(
            &mut self,
        ) -> Result<(MockConn, mpsc::UnboundedReceiver<IceCandidate>)> {
            if self.deny_capture {
                return Err(GullyError::Negotiation("capture device denied".into()));
            }
            self.opens.fetch_add(1, Ordering::Relaxed);
            let log = Arc::new(ConnLog::default());
            self.logs.lock().unwrap().push(Arc::clone(&log));
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok((
                MockConn {
                    log,
                    fail_candidate: self.fail_candidate.clone(),
                },
                rx,
            ))
        }
    }

    fn cand(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    async fn initialized() -> (
        SignalingCoordinator<MockBackend>,
        Arc<StdMutex<Vec<Arc<ConnLog>>>>,
    ) {
        let (backend, _opens, logs) = MockBackend::new();
        let mut coordinator = SignalingCoordinator::new(backend);
        coordinator.initialize().await.unwrap();
        (coordinator, logs)
    }

    fn latest(logs: &Arc<StdMutex<Vec<Arc<ConnLog>>>>) -> Arc<ConnLog> {
        Arc::clone(logs.lock().unwrap().last().unwrap())
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description() {
        let (mut coordinator, logs) = initialized().await;

        coordinator.handle_candidate(cand("c1")).await;
        coordinator.handle_candidate(cand("c2")).await;
        coordinator.handle_candidate(cand("c3")).await;

        let log = latest(&logs);
        // Nothing applied before the description is set.
        assert!(log.applied_candidates.lock().unwrap().is_empty());

        coordinator
            .handle_offer(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();

        let applied: Vec<String> = log
            .applied_candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect();
        assert_eq!(applied, vec!["c1", "c2", "c3"]);
        assert!(coordinator.pending_candidates.is_empty());
    }

    #[tokio::test]
    async fn candidate_after_description_applies_directly() {
        let (mut coordinator, logs) = initialized().await;
        coordinator
            .handle_offer(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();

        coordinator.handle_candidate(cand("late")).await;

        let log = latest(&logs);
        let applied = log.applied_candidates.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert!(coordinator.pending_candidates.is_empty());
    }

    #[tokio::test]
    async fn failed_buffered_candidate_does_not_abort_drain() {
        let (backend, _opens, logs) = {
            let (mut b, opens, logs) = MockBackend::new();
            b.fail_candidate = Some("bad".into());
            (b, opens, logs)
        };
        let mut coordinator = SignalingCoordinator::new(backend);
        coordinator.initialize().await.unwrap();

        coordinator.handle_candidate(cand("c1")).await;
        coordinator.handle_candidate(cand("bad")).await;
        coordinator.handle_candidate(cand("c3")).await;

        coordinator
            .handle_offer(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();

        let log = latest(&logs);
        let applied: Vec<String> = log
            .applied_candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect();
        // The failing one is skipped; the rest land, in order.
        assert_eq!(applied, vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn offer_produces_answer_and_state() {
        let (mut coordinator, logs) = initialized().await;
        let reply = coordinator
            .handle_offer(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Some(ClientMessage::SignalAnswer { description }) if description.kind == "answer"
        ));
        assert_eq!(coordinator.state, SignalingState::HaveRemoteOffer);

        let log = latest(&logs);
        assert_eq!(log.remote_descriptions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn answer_in_idle_is_dropped() {
        let (mut coordinator, logs) = initialized().await;
        coordinator
            .handle_answer(SessionDescription::answer("v=0 stray"))
            .await
            .unwrap();
        assert_eq!(coordinator.state, SignalingState::Idle);
        let log = latest(&logs);
        assert!(log.remote_descriptions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offer_answer_round_reaches_stable() {
        let (mut coordinator, _logs) = initialized().await;
        let offer = coordinator.create_offer().await.unwrap();
        assert!(matches!(offer, Some(ClientMessage::SignalOffer { .. })));
        assert_eq!(coordinator.state, SignalingState::HaveLocalOffer);

        coordinator
            .handle_answer(SessionDescription::answer("v=0 remote-answer"))
            .await
            .unwrap();
        assert_eq!(coordinator.state, SignalingState::Stable);
    }

    #[tokio::test]
    async fn answer_path_drains_buffer() {
        let (mut coordinator, logs) = initialized().await;
        coordinator.create_offer().await.unwrap();

        coordinator.handle_candidate(cand("c1")).await;
        coordinator.handle_candidate(cand("c2")).await;

        coordinator
            .handle_answer(SessionDescription::answer("v=0 remote-answer"))
            .await
            .unwrap();

        let log = latest(&logs);
        let applied: Vec<String> = log
            .applied_candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect();
        assert_eq!(applied, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn glare_offer_is_dropped() {
        let (mut coordinator, logs) = initialized().await;
        coordinator.create_offer().await.unwrap();

        let reply = coordinator
            .handle_offer(SessionDescription::offer("v=0 glare"))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(coordinator.state, SignalingState::HaveLocalOffer);
        let log = latest(&logs);
        assert!(log.remote_descriptions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_create_offer_is_ignored() {
        let (mut coordinator, _logs) = initialized().await;
        coordinator.create_offer().await.unwrap();
        let second = coordinator.create_offer().await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn create_offer_requires_initialize() {
        let (backend, _opens, _logs) = MockBackend::new();
        let mut coordinator = SignalingCoordinator::new(backend);
        let err = coordinator.create_offer().await.unwrap_err();
        assert!(matches!(err, GullyError::Negotiation(_)));
    }

    #[tokio::test]
    async fn offer_before_initialize_is_dropped_not_connected() {
        let (backend, opens, _logs) = MockBackend::new();
        let mut coordinator = SignalingCoordinator::new(backend);
        let reply = coordinator
            .handle_offer(SessionDescription::offer("v=0 uninvited"))
            .await
            .unwrap();
        assert!(reply.is_none());
        // Consent-driven: no connection was created by the inbound offer.
        assert_eq!(opens.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn candidates_buffer_even_before_initialize() {
        let (backend, _opens, logs) = MockBackend::new();
        let mut coordinator = SignalingCoordinator::new(backend);
        coordinator.handle_candidate(cand("early")).await;
        assert_eq!(coordinator.pending_candidates.len(), 1);

        coordinator.initialize().await.unwrap();
        coordinator
            .handle_offer(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();

        let log = latest(&logs);
        let applied = log.applied_candidates.lock().unwrap();
        assert_eq!(applied.len(), 1);
    }

    #[tokio::test]
    async fn capture_denial_leaves_idle() {
        let (mut backend, opens, _logs) = MockBackend::new();
        backend.deny_capture = true;
        let mut coordinator = SignalingCoordinator::new(backend);

        let err = coordinator.initialize().await.unwrap_err();
        assert!(matches!(err, GullyError::Negotiation(_)));
        assert!(!coordinator.is_active());
        assert_eq!(coordinator.state, SignalingState::Idle);
        assert_eq!(opens.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn initialize_twice_rebuilds_connection() {
        let (backend, opens, logs) = MockBackend::new();
        let mut coordinator = SignalingCoordinator::new(backend);
        coordinator.initialize().await.unwrap();
        coordinator.initialize().await.unwrap();

        assert_eq!(opens.load(Ordering::Relaxed), 2);
        // The first connection was closed, not leaked.
        let first = Arc::clone(logs.lock().unwrap().first().unwrap());
        assert!(first.closed.load(Ordering::Acquire));
        assert!(coordinator.is_active());
    }

    #[tokio::test]
    async fn teardown_clears_everything() {
        let (mut coordinator, logs) = initialized().await;
        coordinator.handle_candidate(cand("c1")).await;
        coordinator.create_offer().await.unwrap();

        coordinator.teardown().await;

        assert!(!coordinator.is_active());
        assert_eq!(coordinator.state, SignalingState::Idle);
        assert!(coordinator.pending_candidates.is_empty());
        let log = latest(&logs);
        assert!(log.closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn teardown_without_connection_is_noop() {
        let (backend, _opens, _logs) = MockBackend::new();
        let mut coordinator = SignalingCoordinator::new(backend);
        coordinator.teardown().await;
        assert!(!coordinator.is_active());
    }

    #[tokio::test]
    async fn stable_state_ignores_stray_offer_and_answer() {
        let (mut coordinator, logs) = initialized().await;
        coordinator.create_offer().await.unwrap();
        coordinator
            .handle_answer(SessionDescription::answer("v=0 a"))
            .await
            .unwrap();
        assert_eq!(coordinator.state, SignalingState::Stable);

        let log = latest(&logs);
        let before = log.remote_descriptions.lock().unwrap().len();

        coordinator
            .handle_offer(SessionDescription::offer("v=0 renegotiate"))
            .await
            .unwrap();
        coordinator
            .handle_answer(SessionDescription::answer("v=0 dup"))
            .await
            .unwrap();

        assert_eq!(coordinator.state, SignalingState::Stable);
        assert_eq!(log.remote_descriptions.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn local_candidates_flow_until_gathering_ends() {
        let (backend, _opens, _logs) = MockBackend::new();
        let mut coordinator = SignalingCoordinator::new(backend);

        // Wire a controllable local-candidate stream in.
        let (tx, rx) = mpsc::unbounded_channel();
        coordinator.local_candidates = Some(rx);
        coordinator.conn = None;

        tx.send(cand("l1")).unwrap();
        tx.send(cand("l2")).unwrap();
        drop(tx);

        assert_eq!(
            coordinator.next_local_candidate().await.map(|c| c.candidate),
            Some("l1".into())
        );
        assert_eq!(
            coordinator.next_local_candidate().await.map(|c| c.candidate),
            Some("l2".into())
        );
        // Gathering finished: one final None, then the stream goes quiet.
        assert!(coordinator.next_local_candidate().await.is_none());
        assert!(coordinator.local_candidates.is_none());
    }
}
