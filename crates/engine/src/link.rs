//! The peer link seam: one negotiated media connection.

use std::sync::Arc;

use async_trait::async_trait;
use careline_protocol::{IceCandidate, IceConfig, SessionDescription};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::NegotiationError;
use crate::media::{LocalTrack, TrackInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPolicy {
    All,
    RelayOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    RemoteTrack(TrackInfo),
}

/// Callback output of a link, tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub generation: u64,
    pub kind: LinkEventKind,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

#[async_trait]
pub trait PeerLink: Send + Sync {
    fn generation(&self) -> u64;
    fn policy(&self) -> TransportPolicy;
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), NegotiationError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Build a link. Every callback it produces goes to `events`, tagged with
    /// `generation`.
    async fn create(
        &self,
        ice: &IceConfig,
        policy: TransportPolicy,
        generation: u64,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}

/// The negotiator's handle on its current link. Closes the link when dropped
/// unless it was shut down explicitly.
pub struct ActiveLink {
    link: Arc<dyn PeerLink>,
    closed: bool,
}

impl ActiveLink {
    pub fn new(link: Arc<dyn PeerLink>) -> Self {
        Self { link, closed: false }
    }

    pub fn generation(&self) -> u64 {
        self.link.generation()
    }

    pub fn policy(&self) -> TransportPolicy {
        self.link.policy()
    }

    pub fn handle(&self) -> Arc<dyn PeerLink> {
        Arc::clone(&self.link)
    }

    pub async fn shutdown(mut self) {
        self.closed = true;
        self.link.close().await;
        debug!(generation = self.link.generation(), "Peer link closed");
    }
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let link = Arc::clone(&self.link);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { link.close().await });
        }
    }
}
