//! Addressed per-user signaling: the transport seam and an in-process hub.

mod memory;

pub use memory::{DropRule, MemoryHub};

use async_trait::async_trait;
use careline_protocol::{IceCandidate, NegotiationMessage, SessionDescription};
use tokio::sync::mpsc;

use crate::error::SignalingError;

/// Who a session talks to, and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub conversation_id: String,
    pub local_id: String,
    pub remote_id: String,
}

impl Route {
    /// Reject anything not sent by our peer for our conversation.
    pub fn accept(&self, message: &NegotiationMessage) -> Result<(), SignalingError> {
        if message.conversation_id() != self.conversation_id {
            return Err(SignalingError::ForeignConversation(
                message.conversation_id().to_string(),
            ));
        }
        if message.from_id() != self.remote_id {
            return Err(SignalingError::ForeignSender(message.from_id().to_string()));
        }
        Ok(())
    }
}

/// Inbound messages for one user. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<NegotiationMessage>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<NegotiationMessage>) -> Self {
        Self { rx, on_drop: None }
    }

    /// Run `cleanup` when the subscription is dropped.
    pub fn with_cleanup(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(cleanup));
        self
    }

    /// Next inbound message, or `None` once the transport has gone away.
    pub async fn recv(&mut self) -> Option<NegotiationMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.on_drop.take() {
            cleanup();
        }
    }
}

/// Unreliable, unordered-across-reconnects delivery of negotiation messages
/// to a user's channel. No echo to the sender, no persistence.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn subscribe(&self, user_id: &str) -> Result<Subscription, SignalingError>;

    async fn send(&self, to: &str, message: NegotiationMessage) -> Result<(), SignalingError>;

    async fn send_offer(
        &self,
        route: &Route,
        attempt: u32,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        let message = NegotiationMessage::Offer {
            conversation_id: route.conversation_id.clone(),
            from_id: route.local_id.clone(),
            attempt,
            description,
        };
        self.send(&route.remote_id, message).await
    }

    async fn send_answer(
        &self,
        route: &Route,
        attempt: u32,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        let message = NegotiationMessage::Answer {
            conversation_id: route.conversation_id.clone(),
            from_id: route.local_id.clone(),
            attempt,
            description,
        };
        self.send(&route.remote_id, message).await
    }

    async fn send_candidate(
        &self,
        route: &Route,
        attempt: u32,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let message = NegotiationMessage::Candidate {
            conversation_id: route.conversation_id.clone(),
            from_id: route.local_id.clone(),
            attempt,
            candidate,
        };
        self.send(&route.remote_id, message).await
    }

    async fn send_hangup(&self, route: &Route) -> Result<(), SignalingError> {
        let message = NegotiationMessage::Hangup {
            conversation_id: route.conversation_id.clone(),
            from_id: route.local_id.clone(),
        };
        self.send(&route.remote_id, message).await
    }
}
