//! Peer media abstractions for the voice connection.
//!
//! The client never talks to an audio device or a WebRTC stack directly.
//! [`MediaBackend`] acquires the local capture resource and builds a
//! [`PeerConnection`] around it; the coordinator in [`crate::signaling`]
//! drives that connection through offer/answer negotiation. Backends wrap
//! whatever media engine the application embeds — the contract here is only
//! what the signaling state machine needs.
//!
//! [`DecisionPrompt`] is the one blocking question the client ever asks the
//! environment: play another match, yes or no. Injecting it keeps the event
//! loop free of UI assumptions and lets tests script the answer.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GullyError;
use crate::protocol::{IceCandidate, SessionDescription};

/// One peer media connection under negotiation.
///
/// At most one exists per match session, owned exclusively by the signaling
/// coordinator. Implementations are expected to reject operations that their
/// underlying stack considers out of order; the coordinator's state guards
/// make such rejections rare, and it degrades to logging when they happen.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Create a local offer and apply it as the local description.
    async fn create_offer(&mut self) -> Result<SessionDescription, GullyError>;

    /// Create a local answer (remote description must already be applied)
    /// and apply it as the local description.
    async fn create_answer(&mut self) -> Result<SessionDescription, GullyError>;

    /// Apply the remote peer's session description.
    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), GullyError>;

    /// Apply a remote network candidate. Only valid once the remote
    /// description has been set.
    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), GullyError>;

    /// Release the connection and any media resources it holds.
    async fn close(&mut self);
}

/// Acquires the local audio capture resource and a peer connection.
///
/// `open` is called by `SignalingCoordinator::initialize` — never implicitly.
/// Local candidates gathered by the new connection are delivered on the
/// returned receiver; the backend wires its stack's candidate callback into
/// the sender half and drops it when gathering completes.
#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    /// The connection type this backend produces.
    type Conn: PeerConnection;

    /// Acquire the capture device and build a fresh peer connection.
    ///
    /// # Errors
    ///
    /// Returns [`GullyError::Negotiation`] when the capture device is denied
    /// or the media stack cannot be brought up. The caller leaves signaling
    /// idle in that case.
    async fn open(
        &mut self,
    ) -> Result<(Self::Conn, mpsc::UnboundedReceiver<IceCandidate>), GullyError>;
}

/// A blocking yes/no question put to the environment.
///
/// The client awaits the answer inside its event loop, so a UI
/// implementation should resolve promptly (dialog, console read); tests
/// supply scripted answers.
#[async_trait]
pub trait DecisionPrompt: Send + Sync + 'static {
    /// Ask the question and return the user's decision.
    async fn confirm(&mut self, question: &str) -> bool;
}

/// A [`DecisionPrompt`] that declines every question. Useful for headless
/// consumers that never want a rematch dialog.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDecline;

#[async_trait]
impl DecisionPrompt for AlwaysDecline {
    async fn confirm(&mut self, _question: &str) -> bool {
        false
    }
}

/// A [`MediaBackend`] for consumers without voice support. `open` always
/// fails with a capture denial, so voice intents surface as
/// [`GullyError::Negotiation`] and the match plays on without audio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMedia;

/// The connection type of [`NoMedia`]. Never constructed.
#[derive(Debug)]
pub struct NoConnection {
    _unconstructable: std::convert::Infallible,
}

#[async_trait]
impl PeerConnection for NoConnection {
    async fn create_offer(&mut self) -> Result<SessionDescription, GullyError> {
        match self._unconstructable {}
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, GullyError> {
        match self._unconstructable {}
    }

    async fn set_remote_description(
        &mut self,
        _description: SessionDescription,
    ) -> Result<(), GullyError> {
        match self._unconstructable {}
    }

    async fn add_remote_candidate(&mut self, _candidate: IceCandidate) -> Result<(), GullyError> {
        match self._unconstructable {}
    }

    async fn close(&mut self) {
        match self._unconstructable {}
    }
}

#[async_trait]
impl MediaBackend for NoMedia {
    type Conn = NoConnection;

    async fn open(
        &mut self,
    ) -> Result<(NoConnection, mpsc::UnboundedReceiver<IceCandidate>), GullyError> {
        Err(GullyError::Negotiation("no media backend available".into()))
    }
}
